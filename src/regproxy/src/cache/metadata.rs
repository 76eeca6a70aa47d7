use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Cached blob, persisted as `<hex>.meta.json` next to the blob file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheObject {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub media_type: Option<String>,
    /// Registry the blob was first fetched from
    #[serde(default)]
    pub registry: String,
    pub cached_at: u64, // Unix timestamp
    pub last_access: u64,
}

/// Manifest metadata stored alongside cached manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub registry: String,
    pub repository: String,
    /// Tag or digest the manifest was requested by
    pub reference: String,
    pub digest: String,
    pub content_type: String,
    pub size: u64,
    /// Last time upstream confirmed this content
    pub fetched_at: u64,
}

impl ManifestEntry {
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.fetched_at)
    }
}

/// Tag to digest mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagMapping {
    pub tag: String,
    pub digest: String,
    pub content_type: String,
    pub updated_at: u64,
    /// Last successful fetch or revalidation
    pub fetched_at: u64,
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Validate a `sha256:<64 lowercase hex>` digest and return the hex part.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| ProxyError::InvalidDigest(format!("unsupported digest '{}'", digest)))?;
    if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(ProxyError::InvalidDigest(format!("malformed digest '{}'", digest)));
    }
    Ok(hex)
}

pub fn is_digest(reference: &str) -> bool {
    digest_hex(reference).is_ok()
}

/// Repository path components: lowercase alphanumerics joined by `.`, `_`,
/// `__` or `-` runs, separated by `/`.
pub fn validate_repository(repository: &str) -> Result<()> {
    let valid = !repository.is_empty()
        && repository.len() <= 255
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component
                    .bytes()
                    .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
                && component
                    .bytes()
                    .next()
                    .is_some_and(|b| b.is_ascii_alphanumeric())
        });
    if !valid {
        return Err(ProxyError::InvalidName(format!("'{}'", repository)));
    }
    Ok(())
}

/// Tags: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`
pub fn validate_tag(tag: &str) -> Result<()> {
    let mut bytes = tag.bytes();
    let valid = tag.len() <= 128
        && bytes
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if !valid {
        return Err(ProxyError::InvalidTag(format!("'{}'", tag)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_validation() {
        let good = format!("sha256:{}", "a".repeat(64));
        assert_eq!(digest_hex(&good).unwrap(), "a".repeat(64));

        assert!(digest_hex("sha512:abc").is_err());
        assert!(digest_hex("sha256:abc").is_err());
        assert!(digest_hex(&format!("sha256:{}", "A".repeat(64))).is_err());
        assert!(digest_hex(&format!("sha256:../{}", "a".repeat(61))).is_err());
        assert!(!is_digest("latest"));
    }

    #[test]
    fn repository_and_tag_names() {
        assert!(validate_repository("library/nginx").is_ok());
        assert!(validate_repository("org/sub/app-name_v2").is_ok());
        assert!(validate_repository("../etc").is_err());
        assert!(validate_repository("Library/nginx").is_err());
        assert!(validate_repository("a//b").is_err());

        assert!(validate_tag("1.25-alpine").is_ok());
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("a/b").is_err());
    }

    #[test]
    fn invalid_names_map_to_client_errors() {
        use crate::error::ResourceKind;
        use axum::http::StatusCode;

        let err = validate_repository("Library/nginx").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidName(_)));
        assert_eq!(
            err.to_registry_response(ResourceKind::Manifest).status(),
            StatusCode::BAD_REQUEST
        );

        let err = validate_tag(".hidden").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTag(_)));
        assert_eq!(
            err.to_registry_response(ResourceKind::Manifest).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
