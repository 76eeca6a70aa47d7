//! Single upstream fetch per digest with progressive followers.
//!
//! The fetch task writes the blob to a temp file and publishes how many bytes
//! are durable there. Every client waiting on the digest (the one that
//! started the fetch included) reads the same file up to that mark, so the
//! first byte goes out before the layer is complete and no caller buffers
//! the whole blob.

use super::metadata::digest_hex;
use super::storage::{BlobStream, CacheStorage};
use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

/// A failed integrity check gets one fresh attempt
const MAX_ATTEMPTS: u32 = 2;

const READ_CHUNK: usize = 64 * 1024;

/// Upstream response body handed to the cache.
pub struct UpstreamBlob {
    pub stream: BlobStream,
    pub content_length: Option<u64>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FetchStatus {
    /// Waiting for upstream response headers
    Pending,
    Streaming,
    Complete,
    Failed(Arc<ProxyError>),
}

#[derive(Debug, Clone)]
pub struct FetchState {
    pub attempt: u32,
    /// Temp file while streaming, final blob path once complete
    pub path: Option<PathBuf>,
    pub written: u64,
    pub expected_len: Option<u64>,
    pub media_type: Option<String>,
    pub status: FetchStatus,
}

impl FetchState {
    /// Bytes followers may hand out. The final byte stays back until the
    /// digest is verified, so a body that fails the check always ends short
    /// of its `Content-Length`.
    pub fn readable(&self) -> u64 {
        match self.status {
            FetchStatus::Complete => self.written,
            _ => self.written.saturating_sub(1),
        }
    }

    pub fn pending(attempt: u32) -> Self {
        Self {
            attempt,
            path: None,
            written: 0,
            expected_len: None,
            media_type: None,
            status: FetchStatus::Pending,
        }
    }
}

fn fail(storage: &CacheStorage, digest: &str, tx: &watch::Sender<FetchState>, error: ProxyError) {
    tracing::warn!(digest = %digest, error = %error, "Blob fetch failed");
    storage.finish_fetch(digest);
    let error = Arc::new(error);
    tx.send_modify(|state| state.status = FetchStatus::Failed(error));
}

/// Drive the upstream fetch for `digest` to completion, publishing progress
/// on `tx`. Runs detached from any client connection.
pub(super) async fn run_fetch<F, Fut>(
    storage: Arc<CacheStorage>,
    digest: String,
    registry: String,
    fetch: F,
    tx: watch::Sender<FetchState>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UpstreamBlob>> + Send + 'static,
{
    let hex = match digest_hex(&digest) {
        Ok(hex) => hex.to_string(),
        Err(e) => return fail(&storage, &digest, &tx, e),
    };

    let mut attempt = 1;
    loop {
        let upstream = match fetch().await {
            Ok(upstream) => upstream,
            Err(e) => return fail(&storage, &digest, &tx, e),
        };

        let temp = storage.temp_path(&hex, attempt);
        let media_type = upstream.media_type.clone();
        tx.send_modify(|state| {
            state.path = Some(temp.clone());
            state.written = 0;
            state.expected_len = upstream.content_length;
            state.media_type = upstream.media_type.clone();
            state.status = FetchStatus::Streaming;
        });

        let written = storage
            .write_verified(&digest, &temp, upstream.stream, |written| {
                tx.send_modify(|state| state.written = written)
            })
            .await;

        match written {
            Ok(size) => {
                let committed = storage
                    .commit(&digest, &temp, size, &registry, media_type)
                    .await;
                match committed {
                    Ok(object) => {
                        let path = storage.blob_path(&digest).ok();
                        storage.finish_fetch(&digest);
                        tx.send_modify(|state| {
                            state.path = path;
                            state.written = object.size;
                            state.expected_len = Some(object.size);
                            state.status = FetchStatus::Complete;
                        });
                        tracing::info!(digest = %digest, size = object.size, "Blob fetched and cached");
                        return;
                    }
                    Err(e) => return fail(&storage, &digest, &tx, e),
                }
            }
            Err(ProxyError::Integrity { expected, actual }) if attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    digest = %expected,
                    actual = %actual,
                    attempt = attempt,
                    "Upstream blob failed verification, retrying"
                );
                attempt += 1;
                tx.send_modify(|state| *state = FetchState::pending(attempt));
            }
            Err(e) => return fail(&storage, &digest, &tx, e),
        }
    }
}

/// Reads a blob as the fetch task writes it.
pub struct BlobFollower {
    rx: watch::Receiver<FetchState>,
    attempt: u32,
    file: Option<fs::File>,
    position: u64,
    expected_len: Option<u64>,
    media_type: Option<String>,
    done: bool,
}

impl BlobFollower {
    /// Wait for upstream response headers. Fails with the fetch error when
    /// upstream rejects the request before any bytes exist.
    pub(super) async fn start(mut rx: watch::Receiver<FetchState>) -> Result<Self> {
        loop {
            let state = rx.borrow_and_update().clone();
            match state.status {
                FetchStatus::Pending => {}
                FetchStatus::Failed(e) => return Err(e.duplicate()),
                FetchStatus::Streaming | FetchStatus::Complete => {
                    return Ok(Self {
                        rx,
                        attempt: state.attempt,
                        file: None,
                        position: 0,
                        expected_len: state.expected_len,
                        media_type: state.media_type,
                        done: false,
                    })
                }
            }
            if rx.changed().await.is_err() {
                return Err(ProxyError::Cache(
                    "Blob fetch ended without a result".to_string(),
                ));
            }
        }
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.expected_len
    }

    pub fn media_type(&self) -> Option<String> {
        self.media_type.clone()
    }

    pub fn into_stream(self) -> BlobStream {
        futures::stream::unfold(self, |mut follower| async move {
            follower.next_chunk().await.map(|item| (item, follower))
        })
        .boxed()
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        let item = self.poll_chunk().await;
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }

    async fn poll_chunk(&mut self) -> Option<Result<Bytes>> {
        loop {
            let state = self.rx.borrow_and_update().clone();

            if state.attempt != self.attempt {
                if self.position > 0 {
                    return Some(Err(ProxyError::Cache(
                        "Upstream blob failed verification mid-transfer".to_string(),
                    )));
                }
                self.attempt = state.attempt;
                self.file = None;
            }

            match &state.status {
                FetchStatus::Failed(e) => return Some(Err(e.duplicate())),
                FetchStatus::Pending => {}
                FetchStatus::Streaming | FetchStatus::Complete => {
                    let readable = state.readable();
                    if self.position < readable {
                        match self.read_available(&state, readable).await {
                            Ok(Some(chunk)) => return Some(Ok(chunk)),
                            Ok(None) => {}
                            Err(e) => return Some(Err(e)),
                        }
                    } else if matches!(state.status, FetchStatus::Complete) {
                        return None;
                    }
                }
            }

            if self.rx.changed().await.is_err() {
                // Sender gone; act on the final state, if any
                let state = self.rx.borrow().clone();
                match state.status {
                    FetchStatus::Complete if self.position < state.written => continue,
                    FetchStatus::Complete => return None,
                    FetchStatus::Failed(e) => return Some(Err(e.duplicate())),
                    _ => {
                        return Some(Err(ProxyError::Cache(
                            "Blob fetch ended unexpectedly".to_string(),
                        )))
                    }
                }
            }
        }
    }

    /// Read the next chunk below `limit`. `Ok(None)` means the file moved
    /// (temp renamed into place) and state should be re-read.
    async fn read_available(&mut self, state: &FetchState, limit: u64) -> Result<Option<Bytes>> {
        if self.file.is_none() {
            let Some(path) = state.path.as_ref() else {
                return Ok(None);
            };
            match fs::File::open(path).await {
                Ok(mut file) => {
                    if self.position > 0 {
                        file.seek(std::io::SeekFrom::Start(self.position)).await?;
                    }
                    self.file = Some(file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if matches!(state.status, FetchStatus::Complete) {
                        return Err(ProxyError::Cache(
                            "Blob was removed before it could be served".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let want = (limit - self.position).min(READ_CHUNK as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Cache(format!(
                "Short read at offset {} of in-flight blob",
                self.position
            )));
        }
        buf.truncate(n);
        self.position += n as u64;
        Ok(Some(buf.freeze()))
    }
}
