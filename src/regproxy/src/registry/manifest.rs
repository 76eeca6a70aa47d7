//! Manifest requests: served from cache while fresh, revalidated upstream
//! with `If-None-Match` once the TTL passes, and served stale when upstream
//! is unreachable.

use crate::cache::metadata::{now_unix, ManifestEntry};
use crate::cache::{CachedManifest, ManifestStore};
use crate::config::DEFAULT_MANIFEST_ACCEPT_HEADER;
use crate::error::{ProxyError, ResourceKind, Result};
use crate::registry::route::RegistryId;
use crate::registry::upstream::UpstreamRequest;
use crate::registry::CacheStatus;
use crate::state::{AppState, ProxyStats};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Docker v2 schema 2, assumed when upstream sends no usable type
const FALLBACK_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A digest-referenced manifest that fails verification is fetched once more
const MANIFEST_FETCH_ATTEMPTS: u32 = 2;

/// A manifest ready to send, and how it was obtained.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: CachedManifest,
    pub cache_status: CacheStatus,
}

/// `GET`/`HEAD /v2/<name>/manifests/<reference>`
pub async fn serve_manifest(
    state: AppState,
    registry: RegistryId,
    repository: String,
    reference: String,
    head: bool,
) -> Response {
    match resolve_manifest(&state, &registry, &repository, &reference).await {
        Ok(resolved) => {
            tracing::info!(
                registry = %registry,
                repository = %repository,
                reference = %reference,
                digest = %resolved.manifest.entry.digest,
                cache = resolved.cache_status.as_str(),
                "Manifest served"
            );
            manifest_response(resolved, head)
        }
        Err(e) => {
            if !matches!(e, ProxyError::UpstreamNotFound(_)) {
                ProxyStats::incr(&state.stats.upstream_errors);
            }
            tracing::warn!(
                registry = %registry,
                repository = %repository,
                reference = %reference,
                error = %e,
                "Manifest request failed"
            );
            e.to_registry_response(ResourceKind::Manifest)
        }
    }
}

/// Find `reference` in the cache or fetch it. Concurrent misses for the same
/// reference share one upstream request.
pub async fn resolve_manifest(
    state: &AppState,
    registry: &RegistryId,
    repository: &str,
    reference: &str,
) -> Result<ResolvedManifest> {
    let name = registry.name();
    let cache_config = &state.config.cache;

    if let Some(ttl) = cache_config.negative_ttl_secs {
        if state.manifests.is_known_missing(name, repository, reference, ttl) {
            return Err(ProxyError::UpstreamNotFound(format!(
                "{}/{}:{} recently reported missing",
                name, repository, reference
            )));
        }
    }

    let cached = match state.manifests.lookup(name, repository, reference).await {
        Ok(cached) => cached,
        Err(e) => {
            tracing::warn!(
                registry = %name,
                repository = %repository,
                reference = %reference,
                error = %e,
                "Manifest cache read failed, treating as miss"
            );
            None
        }
    };

    if let Some(manifest) = &cached {
        if ManifestStore::is_fresh(&manifest.entry, cache_config.manifest_ttl_secs) {
            ProxyStats::incr(&state.stats.manifest_hits);
            return Ok(ResolvedManifest {
                manifest: manifest.clone(),
                cache_status: CacheStatus::Hit,
            });
        }
    }

    let key = format!("{}/{}:{}", name, repository, reference);
    let work_state = state.clone();
    let work_registry = registry.clone();
    let work_repository = repository.to_string();
    let work_reference = reference.to_string();
    let resolved = state
        .manifest_flight
        .run(&key, move || async move {
            fetch_manifest(
                work_state,
                work_registry,
                work_repository,
                work_reference,
                cached,
            )
            .await
        })
        .await?;

    let counter = match resolved.cache_status {
        CacheStatus::Hit => &state.stats.manifest_hits,
        CacheStatus::Miss => &state.stats.manifest_misses,
        CacheStatus::Revalidated => &state.stats.manifest_revalidated,
        CacheStatus::Stale => &state.stats.manifest_stale,
    };
    ProxyStats::incr(counter);
    Ok(resolved)
}

async fn fetch_manifest(
    state: AppState,
    registry: RegistryId,
    repository: String,
    reference: String,
    cached: Option<CachedManifest>,
) -> Result<ResolvedManifest> {
    let mut attempt = 1;
    loop {
        let result =
            fetch_manifest_once(&state, &registry, &repository, &reference, cached.clone()).await;
        match result {
            Err(ProxyError::Integrity { expected, actual }) if attempt < MANIFEST_FETCH_ATTEMPTS => {
                tracing::warn!(
                    registry = %registry,
                    repository = %repository,
                    digest = %expected,
                    actual = %actual,
                    attempt = attempt,
                    "Upstream manifest failed verification, retrying"
                );
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn fetch_manifest_once(
    state: &AppState,
    registry: &RegistryId,
    repository: &str,
    reference: &str,
    cached: Option<CachedManifest>,
) -> Result<ResolvedManifest> {
    let name = registry.name();
    let target = state.upstream_target(registry);

    let mut request = UpstreamRequest::new(
        Method::GET,
        format!("/v2/{}/manifests/{}", repository, reference),
    )
    .repository(repository)
    .header(
        header::ACCEPT,
        HeaderValue::from_static(DEFAULT_MANIFEST_ACCEPT_HEADER),
    );
    if let Some(manifest) = &cached {
        if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", manifest.entry.digest)) {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
    }

    match state.upstream.fetch(&target, &request).await {
        Ok(response) if response.status == StatusCode::NOT_MODIFIED => {
            let Some(mut manifest) = cached else {
                return Err(ProxyError::Registry(format!(
                    "{} answered 304 for {}:{} without a conditional request",
                    name, repository, reference
                )));
            };
            if let Err(e) = state
                .manifests
                .mark_revalidated(name, repository, reference)
                .await
            {
                tracing::warn!(error = %e, "Failed to record manifest revalidation");
            }
            manifest.entry.fetched_at = now_unix();
            Ok(ResolvedManifest {
                manifest,
                cache_status: CacheStatus::Revalidated,
            })
        }
        Ok(response) => {
            let upstream_digest = response
                .header_str("docker-content-digest")
                .map(str::to_string);
            let content_type = response
                .header_str("content-type")
                .filter(|ct| !ct.is_empty() && !ct.starts_with("text/"))
                .map(str::to_string);
            let body = response.bytes().await?;
            let content_type = content_type.unwrap_or_else(|| media_type_of(&body));

            let entry = match state
                .manifests
                .store(name, repository, reference, &content_type, &body)
                .await
            {
                Ok(entry) => entry,
                Err(e @ ProxyError::Integrity { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        registry = %name,
                        repository = %repository,
                        reference = %reference,
                        error = %e,
                        "Failed to cache manifest, serving uncached"
                    );
                    uncached_entry(name, repository, reference, &content_type, &body)
                }
            };

            if let Some(upstream_digest) = upstream_digest {
                if upstream_digest != entry.digest {
                    tracing::warn!(
                        registry = %name,
                        repository = %repository,
                        reference = %reference,
                        upstream = %upstream_digest,
                        computed = %entry.digest,
                        "Upstream digest header disagrees with manifest bytes"
                    );
                }
            }

            Ok(ResolvedManifest {
                manifest: CachedManifest { entry, body },
                cache_status: CacheStatus::Miss,
            })
        }
        Err(e @ ProxyError::UpstreamNotFound(_)) => {
            if state.config.cache.negative_ttl_secs.is_some() {
                state.manifests.record_not_found(name, repository, reference);
            }
            if let Err(remove_error) = state.manifests.remove_tag(name, repository, reference).await {
                tracing::debug!(error = %remove_error, "Failed to drop tag record");
            }
            Err(e)
        }
        Err(e) if e.allows_stale() => match cached {
            Some(manifest)
                if ManifestStore::is_within_stale_allowance(
                    &manifest.entry,
                    state.config.cache.stale_allowance_secs,
                ) =>
            {
                tracing::warn!(
                    registry = %name,
                    repository = %repository,
                    reference = %reference,
                    error = %e,
                    "Upstream unavailable, serving stale manifest"
                );
                Ok(ResolvedManifest {
                    manifest,
                    cache_status: CacheStatus::Stale,
                })
            }
            _ => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// `mediaType` field of the manifest JSON, if present.
fn media_type_of(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| FALLBACK_MANIFEST_TYPE.to_string())
}

fn uncached_entry(
    registry: &str,
    repository: &str,
    reference: &str,
    content_type: &str,
    body: &Bytes,
) -> ManifestEntry {
    ManifestEntry {
        registry: registry.to_string(),
        repository: repository.to_string(),
        reference: reference.to_string(),
        digest: format!("sha256:{}", hex::encode(Sha256::digest(body))),
        content_type: content_type.to_string(),
        size: body.len() as u64,
        fetched_at: now_unix(),
    }
}

fn manifest_response(resolved: ResolvedManifest, head: bool) -> Response {
    let entry = &resolved.manifest.entry;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&entry.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_MANIFEST_TYPE)),
    );
    if let Ok(digest) = HeaderValue::from_str(&entry.digest) {
        headers.insert("Docker-Content-Digest", digest.clone());
        if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", entry.digest)) {
            headers.insert(header::ETAG, etag);
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.size));
    headers.insert(
        "Docker-Distribution-API-Version",
        HeaderValue::from_static("registry/2.0"),
    );
    headers.insert("X-Cache", resolved.cache_status.header_value());
    if resolved.cache_status == CacheStatus::Stale {
        headers.insert(
            header::WARNING,
            HeaderValue::from_static("110 - \"Response is Stale\""),
        );
    }

    let body = if head {
        Body::empty()
    } else {
        Body::from(resolved.manifest.body)
    };
    (StatusCode::OK, headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_falls_back_to_schema2() {
        let index = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        assert_eq!(media_type_of(index), "application/vnd.oci.image.index.v1+json");
        assert_eq!(media_type_of(b"{\"schemaVersion\":2}"), FALLBACK_MANIFEST_TYPE);
        assert_eq!(media_type_of(b"not json"), FALLBACK_MANIFEST_TYPE);
    }

    #[test]
    fn stale_responses_carry_warning() {
        let body = Bytes::from_static(b"{}");
        let entry = uncached_entry("docker.io", "library/alpine", "3.20", FALLBACK_MANIFEST_TYPE, &body);
        let response = manifest_response(
            ResolvedManifest {
                manifest: CachedManifest { entry, body },
                cache_status: CacheStatus::Stale,
            },
            false,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "STALE");
        assert!(response.headers().contains_key(header::WARNING));
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "2");
    }
}
