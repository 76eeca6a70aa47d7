use super::follow::{self, BlobFollower, FetchState, UpstreamBlob};
use super::metadata::{digest_hex, now_unix, CacheObject};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;

/// Attempts for component-local filesystem operations
const IO_ATTEMPTS: u32 = 3;

/// Persist `last_access` to the sidecar at most this often per object
const ACCESS_PERSIST_INTERVAL_SECS: u64 = 60;

pub type BlobStream = BoxStream<'static, Result<Bytes>>;

struct IndexEntry {
    object: CacheObject,
    readers: Arc<AtomicUsize>,
    persisted_access: u64,
    /// Orders accesses that share a `last_access` second
    access_seq: u64,
}

/// Keeps an object out of eviction while a response streams it.
pub struct ReaderGuard {
    readers: Arc<AtomicUsize>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An open cached blob.
pub struct CachedBlob {
    pub object: CacheObject,
    pub path: PathBuf,
    file: fs::File,
    guard: ReaderGuard,
}

impl CachedBlob {
    pub fn into_stream(self) -> BlobStream {
        let guard = self.guard;
        ReaderStream::new(self.file)
            .map(move |chunk| {
                let _held = &guard;
                chunk.map_err(ProxyError::from)
            })
            .boxed()
    }
}

/// Blob served to a client, either from disk or while it is being fetched.
pub struct BlobResponse {
    /// Served from a committed object without waiting on upstream
    pub hit: bool,
    pub size: Option<u64>,
    pub media_type: Option<String>,
    pub body: BlobStream,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed_bytes: u64,
    pub skipped_active: usize,
    pub remaining_bytes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetched_bytes: AtomicU64,
    integrity_failures: AtomicU64,
    evicted: AtomicU64,
    evicted_bytes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub objects: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub upstream_fetches: u64,
    pub upstream_bytes: u64,
    pub integrity_failures: u64,
    pub evicted_objects: u64,
    pub evicted_bytes: u64,
}

/// Content-addressable blob storage
pub struct CacheStorage {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
    max_size_bytes: u64,
    index: Mutex<HashMap<String, IndexEntry>>,
    total_bytes: AtomicU64,
    pub(super) in_flight: Mutex<HashMap<String, watch::Receiver<FetchState>>>,
    eviction_lock: tokio::sync::Mutex<()>,
    eviction_pending: AtomicBool,
    counters: Counters,
    temp_seq: AtomicU64,
    access_clock: AtomicU64,
    this: Weak<CacheStorage>,
}

impl CacheStorage {
    /// Open (or create) a store under `base_dir`, rebuilding the index from
    /// disk and clearing leftovers of interrupted writes.
    pub async fn open(base_dir: impl Into<PathBuf>, max_size_bytes: u64) -> Result<Arc<Self>> {
        let base_dir = base_dir.into();
        let blobs_dir = base_dir.join("blobs").join("sha256");
        let tmp_dir = base_dir.join("tmp");

        fs::create_dir_all(&blobs_dir)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create blobs dir: {}", e)))?;
        fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create tmp dir: {}", e)))?;

        clear_directory(&tmp_dir).await;
        let index = rebuild_index(&blobs_dir).await?;
        let total: u64 = index.values().map(|e| e.object.size).sum();

        tracing::info!(
            path = %base_dir.display(),
            objects = index.len(),
            bytes = total,
            max_bytes = max_size_bytes,
            "Blob cache opened"
        );

        let storage = Arc::new_cyclic(|this| Self {
            blobs_dir,
            tmp_dir,
            max_size_bytes,
            index: Mutex::new(index),
            total_bytes: AtomicU64::new(total),
            in_flight: Mutex::new(HashMap::new()),
            eviction_lock: tokio::sync::Mutex::new(()),
            eviction_pending: AtomicBool::new(false),
            counters: Counters::default(),
            temp_seq: AtomicU64::new(0),
            access_clock: AtomicU64::new(0),
            this: this.clone(),
        });
        storage.schedule_eviction();
        Ok(storage)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn total_size(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn object_count(&self) -> usize {
        self.lock_index().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Get blob path for a digest
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir.join(digest_hex(digest)?))
    }

    fn sidecar_path(&self, hex: &str) -> PathBuf {
        self.blobs_dir.join(format!("{}.meta.json", hex))
    }

    pub(super) fn temp_path(&self, hex: &str, attempt: u32) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.tmp_dir
            .join(format!("{}.{}.{}.partial", hex, attempt, seq))
    }

    fn next_access(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, IndexEntry>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, digest: &str) -> bool {
        digest_hex(digest)
            .map(|_| self.lock_index().contains_key(digest))
            .unwrap_or(false)
    }

    /// Metadata of a committed blob, without touching its access time.
    pub fn lookup(&self, digest: &str) -> Option<CacheObject> {
        self.lock_index().get(digest).map(|e| e.object.clone())
    }

    /// Open a committed blob for reading. Bumps its access time and holds a
    /// reader guard until the returned value is dropped.
    pub async fn get(&self, digest: &str) -> Result<Option<CachedBlob>> {
        let hex = digest_hex(digest)?.to_string();
        let now = now_unix();

        let (object, guard, persist) = {
            let mut index = self.lock_index();
            let Some(entry) = index.get_mut(digest) else {
                return Ok(None);
            };
            entry.object.last_access = now;
            entry.access_seq = self.next_access();
            entry.readers.fetch_add(1, Ordering::AcqRel);
            let persist = now.saturating_sub(entry.persisted_access) >= ACCESS_PERSIST_INTERVAL_SECS;
            if persist {
                entry.persisted_access = now;
            }
            (
                entry.object.clone(),
                ReaderGuard {
                    readers: entry.readers.clone(),
                },
                persist,
            )
        };

        let path = self.blobs_dir.join(&hex);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(digest = %digest, "Indexed blob missing on disk, dropping entry");
                drop(guard);
                self.forget(digest);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if persist {
            let sidecar = self.sidecar_path(&hex);
            let object = object.clone();
            tokio::spawn(async move {
                if let Err(e) = write_sidecar(&sidecar, &object).await {
                    tracing::debug!(digest = %object.digest, error = %e, "Failed to persist access time");
                }
            });
        }

        Ok(Some(CachedBlob {
            object,
            path,
            file,
            guard,
        }))
    }

    fn forget(&self, digest: &str) {
        if let Some(entry) = self.lock_index().remove(digest) {
            self.total_bytes.fetch_sub(entry.object.size, Ordering::AcqRel);
        }
    }

    /// Stream `data` into the store, verifying it hashes to `digest` before
    /// the object becomes visible.
    pub async fn put<S>(
        &self,
        digest: &str,
        registry: &str,
        media_type: Option<String>,
        data: S,
    ) -> Result<CacheObject>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let hex = digest_hex(digest)?.to_string();
        if let Some(object) = self.lookup(digest) {
            return Ok(object);
        }
        let temp = self.temp_path(&hex, 1);
        let written = self.write_verified(digest, &temp, data, |_| {}).await?;
        self.commit(digest, &temp, written, registry, media_type).await
    }

    /// Write `data` to `temp` while hashing. `progress` observes the durable
    /// byte count after each chunk. The temp file is removed on failure.
    pub(super) async fn write_verified<S, P>(
        &self,
        digest: &str,
        temp: &Path,
        mut data: S,
        mut progress: P,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
        P: FnMut(u64),
    {
        let result = async {
            let mut file = retry_io("create temp blob", || fs::File::create(temp)).await?;
            let mut hasher = Sha256::new();
            let mut written = 0u64;

            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                // Followers read the file directly; publish only flushed bytes
                file.flush().await?;
                written += chunk.len() as u64;
                progress(written);
            }
            file.sync_all().await?;
            self.counters
                .fetched_bytes
                .fetch_add(written, Ordering::Relaxed);

            let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
            if actual != digest {
                self.counters
                    .integrity_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::Integrity {
                    expected: digest.to_string(),
                    actual,
                });
            }
            Ok(written)
        }
        .await;

        if result.is_err() {
            remove_quietly(temp).await;
        }
        result
    }

    /// Move a verified temp file into place and index it.
    pub(super) async fn commit(
        &self,
        digest: &str,
        temp: &Path,
        size: u64,
        registry: &str,
        media_type: Option<String>,
    ) -> Result<CacheObject> {
        let hex = digest_hex(digest)?;
        let path = self.blobs_dir.join(hex);
        let now = now_unix();
        let object = CacheObject {
            digest: digest.to_string(),
            size,
            media_type,
            registry: registry.to_string(),
            cached_at: now,
            last_access: now,
        };

        if let Err(e) = retry_io("rename blob", || fs::rename(temp, &path)).await {
            remove_quietly(temp).await;
            return Err(ProxyError::Cache(format!(
                "Failed to move blob {} into place: {}",
                digest, e
            )));
        }
        if let Err(e) = write_sidecar(&self.sidecar_path(hex), &object).await {
            // Index rebuild recreates a missing sidecar from the blob file
            tracing::warn!(digest = %digest, error = %e, "Failed to write blob metadata");
        }

        let inserted = {
            let mut index = self.lock_index();
            if index.contains_key(digest) {
                false
            } else {
                index.insert(
                    digest.to_string(),
                    IndexEntry {
                        object: object.clone(),
                        readers: Arc::new(AtomicUsize::new(0)),
                        persisted_access: now,
                        access_seq: self.next_access(),
                    },
                );
                true
            }
        };
        if inserted {
            self.total_bytes.fetch_add(size, Ordering::AcqRel);
        }

        tracing::debug!(digest = %digest, size = size, registry = %registry, "Blob committed to cache");
        self.schedule_eviction();
        Ok(object)
    }

    /// Serve `digest` from disk, or fetch it once from upstream and stream it
    /// to every concurrent caller while it is written.
    ///
    /// `fetch` is invoked once per attempt; an integrity failure is retried
    /// with a fresh attempt.
    pub async fn get_or_fetch<F, Fut>(
        self: &Arc<Self>,
        digest: &str,
        registry: &str,
        fetch: F,
    ) -> Result<BlobResponse>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UpstreamBlob>> + Send + 'static,
    {
        digest_hex(digest)?;

        loop {
            if let Some(blob) = self.get(digest).await? {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                let object = blob.object.clone();
                return Ok(BlobResponse {
                    hit: true,
                    size: Some(object.size),
                    media_type: object.media_type,
                    body: blob.into_stream(),
                });
            }

            let (rx, leader) = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                // Re-check under the in-flight lock: commit indexes before it
                // leaves the in-flight map.
                if self.lock_index().contains_key(digest) {
                    (None, None)
                } else if let Some(rx) = in_flight.get(digest) {
                    (Some(rx.clone()), None)
                } else {
                    let (tx, rx) = watch::channel(FetchState::pending(1));
                    in_flight.insert(digest.to_string(), rx.clone());
                    (Some(rx), Some(tx))
                }
            };

            let Some(rx) = rx else {
                continue;
            };

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(tx) = leader {
                self.counters.fetches.fetch_add(1, Ordering::Relaxed);
                tracing::info!(digest = %digest, registry = %registry, "Cache miss, fetching blob from upstream");
                tokio::spawn(follow::run_fetch(
                    self.clone(),
                    digest.to_string(),
                    registry.to_string(),
                    fetch,
                    tx,
                ));
            } else {
                tracing::debug!(digest = %digest, "Joining in-flight blob fetch");
            }

            let follower = BlobFollower::start(rx).await?;
            return Ok(BlobResponse {
                hit: false,
                size: follower.expected_len(),
                media_type: follower.media_type(),
                body: follower.into_stream(),
            });
        }
    }

    pub(super) fn finish_fetch(&self, digest: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(digest);
    }

    /// Spawn an eviction pass if the store is over budget. Concurrent
    /// requests coalesce into one pending pass.
    pub fn schedule_eviction(&self) {
        if self.total_size() <= self.max_size_bytes {
            return;
        }
        if self.eviction_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(storage) = self.this.upgrade() else {
            self.eviction_pending.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            storage.eviction_pending.store(false, Ordering::Release);
            if let Err(e) = storage.evict_if_over_budget().await {
                tracing::warn!(error = %e, "Cache eviction failed");
            }
        });
    }

    /// Evict least recently accessed objects until the store fits its budget.
    /// Objects being read are skipped.
    pub async fn evict_if_over_budget(&self) -> Result<EvictionReport> {
        let _guard = self.eviction_lock.lock().await;
        let mut report = EvictionReport::default();

        if self.total_size() <= self.max_size_bytes {
            report.remaining_bytes = self.total_size();
            return Ok(report);
        }

        let mut candidates: Vec<(String, (u64, u64))> = {
            let index = self.lock_index();
            index
                .iter()
                .map(|(digest, entry)| {
                    (
                        digest.clone(),
                        (entry.object.last_access, entry.access_seq),
                    )
                })
                .collect()
        };
        // LRU: oldest access first
        candidates.sort_by_key(|(_, order)| *order);

        for (digest, _) in candidates {
            if self.total_size() <= self.max_size_bytes {
                break;
            }

            let removed = {
                let mut index = self.lock_index();
                match index.get(&digest) {
                    Some(entry) if entry.readers.load(Ordering::Acquire) > 0 => {
                        report.skipped_active += 1;
                        None
                    }
                    Some(_) => index.remove(&digest),
                    None => None,
                }
            };
            let Some(entry) = removed else {
                continue;
            };

            self.total_bytes
                .fetch_sub(entry.object.size, Ordering::AcqRel);
            let hex = digest_hex(&digest)?;
            let blob = self.blobs_dir.join(hex);
            if let Err(e) = remove_file_retrying(&blob).await {
                tracing::warn!(digest = %digest, error = %e, "Failed to remove evicted blob");
            }
            remove_quietly(&self.sidecar_path(hex)).await;

            report.evicted += 1;
            report.freed_bytes += entry.object.size;
            tracing::debug!(digest = %digest, size = entry.object.size, "Evicted blob");
        }

        report.remaining_bytes = self.total_size();
        self.counters
            .evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.counters
            .evicted_bytes
            .fetch_add(report.freed_bytes, Ordering::Relaxed);

        if report.evicted > 0 {
            tracing::info!(
                evicted = report.evicted,
                freed_bytes = report.freed_bytes,
                remaining_bytes = report.remaining_bytes,
                max_bytes = self.max_size_bytes,
                "Cache eviction finished"
            );
        }
        if report.remaining_bytes > self.max_size_bytes {
            tracing::warn!(
                remaining_bytes = report.remaining_bytes,
                skipped_active = report.skipped_active,
                "Cache still over budget; remaining objects are in use"
            );
        }

        Ok(report)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            objects: self.object_count(),
            total_bytes: self.total_size(),
            max_bytes: self.max_size_bytes,
            in_flight: self.in_flight_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            upstream_fetches: self.counters.fetches.load(Ordering::Relaxed),
            upstream_bytes: self.counters.fetched_bytes.load(Ordering::Relaxed),
            integrity_failures: self.counters.integrity_failures.load(Ordering::Relaxed),
            evicted_objects: self.counters.evicted.load(Ordering::Relaxed),
            evicted_bytes: self.counters.evicted_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Retry a filesystem operation with exponential backoff. `NotFound` is
/// returned immediately.
pub(crate) async fn retry_io<T, F, Fut>(op: &str, mut f: F) -> std::io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut delay = Duration::from_millis(25);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < IO_ATTEMPTS && e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(op = op, attempt = attempt, error = %e, "I/O operation failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn remove_file_retrying(path: &Path) -> std::io::Result<()> {
    match retry_io("remove file", || fs::remove_file(path)).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub(super) async fn remove_quietly(path: &Path) {
    if let Err(e) = remove_file_retrying(path).await {
        tracing::debug!(path = %path.display(), error = %e, "Failed to remove file");
    }
}

async fn write_sidecar(path: &Path, object: &CacheObject) -> Result<()> {
    let json = serde_json::to_vec(object)?;
    let tmp = path.with_extension("json.tmp");
    retry_io("write sidecar", || fs::write(&tmp, &json)).await?;
    retry_io("rename sidecar", || fs::rename(&tmp, path)).await?;
    Ok(())
}

async fn clear_directory(dir: &Path) {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        tracing::debug!(path = %entry.path().display(), "Removing leftover temp file");
        remove_quietly(&entry.path()).await;
    }
}

fn is_hex_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

async fn rebuild_index(blobs_dir: &Path) -> Result<HashMap<String, IndexEntry>> {
    let mut blobs: Vec<(String, u64, u64)> = Vec::new();
    let mut sidecars: Vec<String> = Vec::new();

    let mut entries = fs::read_dir(blobs_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if is_hex_name(&name) {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            blobs.push((name, meta.len(), mtime));
        } else if let Some(hex) = name.strip_suffix(".meta.json") {
            sidecars.push(hex.to_string());
        } else {
            // Stale temp files from older layouts
            remove_quietly(&entry.path()).await;
        }
    }

    let mut index = HashMap::with_capacity(blobs.len());
    for (hex, size, mtime) in blobs {
        let digest = format!("sha256:{}", hex);
        let sidecar = blobs_dir.join(format!("{}.meta.json", hex));
        let stored: Option<CacheObject> = fs::read(&sidecar)
            .await
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok());

        let object = match stored {
            Some(object) if object.size == size && object.digest == digest => object,
            Some(_) => {
                tracing::warn!(digest = %digest, "Blob size disagrees with metadata, removing");
                remove_quietly(&blobs_dir.join(&hex)).await;
                remove_quietly(&sidecar).await;
                continue;
            }
            None => {
                let object = CacheObject {
                    digest: digest.clone(),
                    size,
                    media_type: None,
                    registry: String::new(),
                    cached_at: mtime,
                    last_access: mtime,
                };
                if let Err(e) = write_sidecar(&sidecar, &object).await {
                    tracing::debug!(digest = %digest, error = %e, "Failed to recreate metadata");
                }
                object
            }
        };

        index.insert(
            digest,
            IndexEntry {
                persisted_access: object.last_access,
                object,
                readers: Arc::new(AtomicUsize::new(0)),
                access_seq: 0,
            },
        );
    }

    for hex in sidecars {
        if !index.contains_key(&format!("sha256:{}", hex)) {
            tracing::debug!(digest = %hex, "Removing orphaned blob metadata");
            remove_quietly(&blobs_dir.join(format!("{}.meta.json", hex))).await;
        }
    }

    Ok(index)
}
