//! Uncached registry calls (tag lists, referrers, token endpoints, pushes)
//! relayed to the registry's upstream.

use crate::error::{registry_error_response, ResourceKind};
use crate::registry::route::RegistryId;
use crate::registry::upstream::UpstreamRequest;
use crate::registry::RequestOrigin;
use crate::state::{AppState, ProxyStats};
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::Response,
};

/// Request bodies are buffered before forwarding
const MAX_PASSTHROUGH_BODY: usize = 32 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Relay `req` to the registry's first upstream (`upstream_base_url` when the
/// router chose one) and stream the answer back whatever its status.
pub async fn forward(
    state: AppState,
    registry: RegistryId,
    upstream_base_url: Option<String>,
    origin: RequestOrigin,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PASSTHROUGH_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return registry_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "SIZE_INVALID",
                &format!("request body rejected: {}", e),
            )
        }
    };

    let path = upstream_path(&registry, &origin, parts.uri.path(), parts.uri.query());

    let mut headers = HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        // Upstream credentials are the proxy's own
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::AUTHORIZATION
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut request = UpstreamRequest::new(parts.method.clone(), path.clone());
    request.headers = headers;
    request.repository = repository_of(&path);
    request.body = (!body.is_empty()).then_some(body);

    tracing::debug!(
        registry = %registry,
        method = %parts.method,
        path = %path,
        "Passing request through uncached"
    );

    let mut target = state.upstream_target(&registry);
    if let Some(base) = upstream_base_url {
        target.mirrors.retain(|mirror| *mirror != base);
        target.mirrors.insert(0, base);
    }
    match state.upstream.forward(&target, &request).await {
        Ok(upstream) => {
            let mut response = Response::new(Body::from_stream(upstream.body));
            *response.status_mut() = upstream.status;
            for (name, value) in upstream.headers.iter() {
                if !is_hop_by_hop(name) {
                    response.headers_mut().append(name.clone(), value.clone());
                }
            }
            response
        }
        Err(e) => {
            ProxyStats::incr(&state.stats.upstream_errors);
            tracing::warn!(registry = %registry, path = %path, error = %e, "Pass-through request failed");
            e.to_registry_response(ResourceKind::Other)
        }
    }
}

/// Path and query to request upstream. Mirror-mode requests lose the `ns`
/// parameter and any registry host prefix in the name.
fn upstream_path(registry: &RegistryId, origin: &RequestOrigin, path: &str, query: Option<&str>) -> String {
    let mut path = path.to_string();
    let mut query = query.map(str::to_string);

    if *origin == RequestOrigin::Mirror {
        let prefix = format!("/v2/{}/", registry.name());
        if let Some(rest) = path.strip_prefix(&prefix) {
            path = format!("/v2/{}", rest);
        }
        query = query.map(|q| {
            q.split('&')
                .filter(|pair| !pair.starts_with("ns="))
                .collect::<Vec<_>>()
                .join("&")
        });
    }

    match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    }
}

/// Repository named by a `/v2/<name>/<resource>/...` path, for token scope.
fn repository_of(path: &str) -> Option<String> {
    let rest = path.split('?').next()?.strip_prefix("/v2/")?;
    ["/tags/", "/manifests/", "/blobs/", "/referrers/"]
        .iter()
        .filter_map(|marker| rest.find(marker).map(|i| &rest[..i]))
        .min_by_key(|name| name.len())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
