use super::metadata::{
    digest_hex, is_digest, now_unix, validate_repository, validate_tag, ManifestEntry, TagMapping,
};
use super::storage::{remove_quietly, retry_io};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::fs;

/// Manifest bytes with the metadata they were cached under.
#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub entry: ManifestEntry,
    pub body: Bytes,
}

/// Manifest cache.
///
/// Layout under `<cache>/manifests/<registry>/<repository>/`:
/// `sha256/<hex>.json` (bytes), `sha256/<hex>.meta.json` (entry) and
/// `tags/<tag>.json` (tag record).
pub struct ManifestStore {
    manifests_dir: PathBuf,
    negative: Mutex<HashMap<String, u64>>,
    count: AtomicU64,
    temp_seq: AtomicU64,
}

impl ManifestStore {
    pub async fn open(base_dir: &Path) -> Result<Self> {
        let manifests_dir = base_dir.join("manifests");
        fs::create_dir_all(&manifests_dir)
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to create manifests dir: {}", e)))?;

        let scan_dir = manifests_dir.clone();
        let count = tokio::task::spawn_blocking(move || count_manifests(&scan_dir))
            .await
            .map_err(|e| ProxyError::Cache(format!("Manifest scan failed: {}", e)))?;

        Ok(Self {
            manifests_dir,
            negative: Mutex::new(HashMap::new()),
            count: AtomicU64::new(count),
            temp_seq: AtomicU64::new(0),
        })
    }

    /// Number of distinct manifests on disk.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn repo_dir(&self, registry: &str, repository: &str) -> Result<PathBuf> {
        validate_repository(repository)?;
        let registry = sanitize_registry(registry)?;
        Ok(self.manifests_dir.join(registry).join(repository))
    }

    fn digest_paths(&self, registry: &str, repository: &str, digest: &str) -> Result<(PathBuf, PathBuf)> {
        let hex = digest_hex(digest)?;
        let dir = self.repo_dir(registry, repository)?.join("sha256");
        Ok((
            dir.join(format!("{}.json", hex)),
            dir.join(format!("{}.meta.json", hex)),
        ))
    }

    fn tag_path(&self, registry: &str, repository: &str, tag: &str) -> Result<PathBuf> {
        validate_tag(tag)?;
        Ok(self
            .repo_dir(registry, repository)?
            .join("tags")
            .join(format!("{}.json", tag)))
    }

    /// Find a cached manifest by tag or digest.
    pub async fn lookup(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<Option<CachedManifest>> {
        if is_digest(reference) {
            return self.read_by_digest(registry, repository, reference).await;
        }

        let tag_path = self.tag_path(registry, repository, reference)?;
        let Some(mapping) = read_json::<TagMapping>(&tag_path).await else {
            return Ok(None);
        };

        let Some(mut manifest) = self
            .read_by_digest(registry, repository, &mapping.digest)
            .await?
        else {
            tracing::debug!(
                registry = %registry,
                repository = %repository,
                tag = %reference,
                digest = %mapping.digest,
                "Tag points at a missing manifest"
            );
            return Ok(None);
        };

        manifest.entry.reference = reference.to_string();
        manifest.entry.fetched_at = mapping.fetched_at;
        Ok(Some(manifest))
    }

    async fn read_by_digest(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<Option<CachedManifest>> {
        let (body_path, meta_path) = self.digest_paths(registry, repository, digest)?;
        let body = match fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(entry) = read_json::<ManifestEntry>(&meta_path).await else {
            return Ok(None);
        };
        Ok(Some(CachedManifest {
            entry,
            body: Bytes::from(body),
        }))
    }

    /// Cache `body` for `reference`. Digest references must match the bytes.
    pub async fn store(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<ManifestEntry> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(body)));
        if is_digest(reference) && reference != digest {
            return Err(ProxyError::Integrity {
                expected: reference.to_string(),
                actual: digest,
            });
        }

        let now = now_unix();
        let entry = ManifestEntry {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
            digest: digest.clone(),
            content_type: content_type.to_string(),
            size: body.len() as u64,
            fetched_at: now,
        };

        let (body_path, meta_path) = self.digest_paths(registry, repository, &digest)?;
        let is_new = !fs::try_exists(&body_path).await.unwrap_or(false);
        self.write_atomic(&body_path, body).await?;
        let mut stored = entry.clone();
        stored.reference = digest.clone();
        self.write_atomic(&meta_path, &serde_json::to_vec(&stored)?)
            .await?;
        if is_new {
            self.count.fetch_add(1, Ordering::Relaxed);
        }

        if !is_digest(reference) {
            let mapping = TagMapping {
                tag: reference.to_string(),
                digest: digest.clone(),
                content_type: content_type.to_string(),
                updated_at: now,
                fetched_at: now,
            };
            let tag_path = self.tag_path(registry, repository, reference)?;
            self.write_atomic(&tag_path, &serde_json::to_vec(&mapping)?)
                .await?;
        }

        self.clear_not_found(registry, repository, reference);

        tracing::debug!(
            registry = %registry,
            repository = %repository,
            reference = %reference,
            digest = %digest,
            size = body.len(),
            "Manifest cached"
        );
        Ok(entry)
    }

    /// Record that upstream confirmed the tag still points at its digest.
    pub async fn mark_revalidated(&self, registry: &str, repository: &str, tag: &str) -> Result<()> {
        if is_digest(tag) {
            return Ok(());
        }
        let path = self.tag_path(registry, repository, tag)?;
        let Some(mut mapping) = read_json::<TagMapping>(&path).await else {
            return Ok(());
        };
        mapping.fetched_at = now_unix();
        self.write_atomic(&path, &serde_json::to_vec(&mapping)?).await
    }

    /// Drop a tag record (upstream says the tag is gone).
    pub async fn remove_tag(&self, registry: &str, repository: &str, tag: &str) -> Result<()> {
        if is_digest(tag) {
            return Ok(());
        }
        let path = self.tag_path(registry, repository, tag)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Digest-addressed manifests never change; tags are fresh for `ttl_secs`.
    pub fn is_fresh(entry: &ManifestEntry, ttl_secs: u64) -> bool {
        is_digest(&entry.reference) || entry.age_secs(now_unix()) < ttl_secs
    }

    pub fn is_within_stale_allowance(entry: &ManifestEntry, allowance_secs: u64) -> bool {
        entry.age_secs(now_unix()) <= allowance_secs
    }

    fn negative_key(registry: &str, repository: &str, reference: &str) -> String {
        format!("{}/{}:{}", registry, repository, reference)
    }

    pub fn record_not_found(&self, registry: &str, repository: &str, reference: &str) {
        let mut negative = self.negative.lock().unwrap_or_else(|e| e.into_inner());
        negative.insert(Self::negative_key(registry, repository, reference), now_unix());
    }

    /// Whether upstream answered 404 for this reference within `ttl_secs`.
    pub fn is_known_missing(&self, registry: &str, repository: &str, reference: &str, ttl_secs: u64) -> bool {
        let key = Self::negative_key(registry, repository, reference);
        let mut negative = self.negative.lock().unwrap_or_else(|e| e.into_inner());
        match negative.get(&key) {
            Some(recorded) if now_unix().saturating_sub(*recorded) < ttl_secs => true,
            Some(_) => {
                negative.remove(&key);
                false
            }
            None => false,
        }
    }

    fn clear_not_found(&self, registry: &str, repository: &str, reference: &str) {
        let mut negative = self.negative.lock().unwrap_or_else(|e| e.into_inner());
        negative.remove(&Self::negative_key(registry, repository, reference));
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            retry_io("create manifest dir", || fs::create_dir_all(parent))
                .await
                .map_err(|e| ProxyError::Cache(format!("Failed to create manifest dir: {}", e)))?;
        }
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_extension(format!("{}.tmp", seq));
        retry_io("write manifest", || fs::write(&temp, data))
            .await
            .map_err(|e| ProxyError::Cache(format!("Failed to write {}: {}", path.display(), e)))?;
        if let Err(e) = retry_io("rename manifest", || fs::rename(&temp, path)).await {
            remove_quietly(&temp).await;
            return Err(ProxyError::Cache(format!(
                "Failed to rename {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

fn sanitize_registry(registry: &str) -> Result<String> {
    let valid = !registry.is_empty()
        && !registry.starts_with('.')
        && registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'));
    if !valid {
        return Err(ProxyError::Registry(format!("invalid registry '{}'", registry)));
    }
    Ok(registry.to_ascii_lowercase().replace(':', "_"))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable cache record");
            None
        }
    }
}

fn count_manifests(dir: &Path) -> u64 {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let in_digest_dir = dir.file_name().is_some_and(|n| n == "sha256");
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if in_digest_dir && name.ends_with(".json") && !name.ends_with(".meta.json") {
                count += 1;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tag_and_digest_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).await.unwrap();
        let body = br#"{"schemaVersion":2}"#;

        let entry = store
            .store("docker.io", "library/alpine", "3.20", "application/vnd.oci.image.index.v1+json", body)
            .await
            .unwrap();
        assert_eq!(store.count(), 1);

        let by_tag = store
            .lookup("docker.io", "library/alpine", "3.20")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_tag.entry.digest, entry.digest);
        assert_eq!(by_tag.body.as_ref(), body);
        assert!(ManifestStore::is_fresh(&by_tag.entry, 60));
        assert!(!ManifestStore::is_fresh(&by_tag.entry, 0));

        let by_digest = store
            .lookup("docker.io", "library/alpine", &entry.digest)
            .await
            .unwrap()
            .unwrap();
        assert!(ManifestStore::is_fresh(&by_digest.entry, 0));

        store.remove_tag("docker.io", "library/alpine", "3.20").await.unwrap();
        assert!(store
            .lookup("docker.io", "library/alpine", "3.20")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn digest_reference_must_match_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).await.unwrap();
        let wrong = format!("sha256:{}", "0".repeat(64));
        let err = store
            .store("ghcr.io", "org/app", &wrong, "application/json", b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Integrity { .. }));
    }

    #[tokio::test]
    async fn negative_entries_expire() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).await.unwrap();
        store.record_not_found("quay.io", "org/app", "missing");
        assert!(store.is_known_missing("quay.io", "org/app", "missing", 60));
        assert!(!store.is_known_missing("quay.io", "org/app", "missing", 0));
    }
}
