use crate::cache::metadata::digest_hex;
use crate::cache::{BlobResponse, UpstreamBlob};
use crate::error::{ProxyError, ResourceKind};
use crate::registry::route::RegistryId;
use crate::registry::upstream::UpstreamRequest;
use crate::registry::CacheStatus;
use crate::state::{AppState, ProxyStats};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};

const DEFAULT_BLOB_TYPE: &str = "application/octet-stream";

/// `GET`/`HEAD /v2/<name>/blobs/<digest>`
///
/// Hits stream from disk. Misses join (or start) the single upstream fetch
/// for the digest and stream while the layer is written and verified.
pub async fn serve_blob(
    state: AppState,
    registry: RegistryId,
    repository: String,
    digest: String,
    head: bool,
) -> Response {
    if let Err(e) = digest_hex(&digest) {
        return e.to_registry_response(ResourceKind::Blob);
    }
    if head {
        return head_blob(state, registry, repository, digest).await;
    }

    let target = state.upstream_target(&registry);
    let upstream = state.upstream.clone();
    let request = UpstreamRequest::new(
        Method::GET,
        format!("/v2/{}/blobs/{}", repository, digest),
    )
    .repository(&repository);

    let fetch = move || {
        let upstream = upstream.clone();
        let target = target.clone();
        let request = request.clone();
        async move {
            let response = upstream.fetch(&target, &request).await?;
            let media_type = response.header_str("content-type").map(str::to_string);
            Ok(UpstreamBlob {
                content_length: response.content_length,
                media_type,
                stream: response.body,
            })
        }
    };

    match state.cache.get_or_fetch(&digest, registry.name(), fetch).await {
        Ok(blob) => {
            tracing::debug!(
                registry = %registry,
                repository = %repository,
                digest = %digest,
                hit = blob.hit,
                size = ?blob.size,
                "Serving blob"
            );
            blob_response(&digest, blob)
        }
        Err(e) => blob_error(&state, &registry, &digest, e),
    }
}

async fn head_blob(
    state: AppState,
    registry: RegistryId,
    repository: String,
    digest: String,
) -> Response {
    if let Some(object) = state.cache.lookup(&digest) {
        let headers = blob_headers(
            &digest,
            object.media_type.as_deref(),
            Some(object.size),
            CacheStatus::Hit,
        );
        return (StatusCode::OK, headers, Body::empty()).into_response();
    }

    let target = state.upstream_target(&registry);
    let request = UpstreamRequest::new(
        Method::HEAD,
        format!("/v2/{}/blobs/{}", repository, digest),
    )
    .repository(&repository);

    match state.upstream.fetch(&target, &request).await {
        Ok(response) => {
            let headers = blob_headers(
                &digest,
                response.header_str("content-type"),
                response.content_length,
                CacheStatus::Miss,
            );
            (StatusCode::OK, headers, Body::empty()).into_response()
        }
        Err(e) => blob_error(&state, &registry, &digest, e),
    }
}

fn blob_response(digest: &str, blob: BlobResponse) -> Response {
    let status = if blob.hit {
        CacheStatus::Hit
    } else {
        CacheStatus::Miss
    };
    let headers = blob_headers(digest, blob.media_type.as_deref(), blob.size, status);
    (StatusCode::OK, headers, Body::from_stream(blob.body)).into_response()
}

fn blob_headers(
    digest: &str,
    media_type: Option<&str>,
    size: Option<u64>,
    status: CacheStatus,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = media_type
        .and_then(|t| HeaderValue::from_str(t).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_BLOB_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(value) = HeaderValue::from_str(digest) {
        headers.insert("Docker-Content-Digest", value);
    }
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    headers.insert("X-Cache", status.header_value());
    headers
}

fn blob_error(state: &AppState, registry: &RegistryId, digest: &str, error: ProxyError) -> Response {
    if !matches!(error, ProxyError::UpstreamNotFound(_)) {
        ProxyStats::incr(&state.stats.upstream_errors);
    }
    tracing::warn!(
        registry = %registry,
        digest = %digest,
        error = %error,
        "Blob request failed"
    );
    error.to_registry_response(ResourceKind::Blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_default_content_type() {
        let digest = format!("sha256:{}", "c".repeat(64));
        let headers = blob_headers(&digest, None, Some(42), CacheStatus::Hit);
        assert_eq!(headers[header::CONTENT_TYPE], DEFAULT_BLOB_TYPE);
        assert_eq!(headers[header::CONTENT_LENGTH], "42");
        assert_eq!(headers["docker-content-digest"], digest.as_str());
        assert_eq!(headers["x-cache"], "HIT");

        let headers = blob_headers(&digest, Some("application/vnd.oci.image.layer.v1.tar+gzip"), None, CacheStatus::Miss);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.oci.image.layer.v1.tar+gzip");
        assert!(!headers.contains_key(header::CONTENT_LENGTH));
    }
}
