pub mod auth;
pub mod blob;
pub mod manifest;
pub mod passthrough;
pub mod route;
pub mod upstream;

use crate::error::registry_error_response;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use route::RouteKind;

pub use route::{RegistryId, RequestRouter, RouteDecision};
pub use upstream::{UpstreamClient, UpstreamRequest, UpstreamTarget};

/// Value of the `X-Cache` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Revalidated,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Revalidated => "REVALIDATED",
            CacheStatus::Stale => "STALE",
        }
    }

    pub fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// Host of a TLS-intercepted connection, attached to each of its requests.
#[derive(Debug, Clone)]
pub struct InterceptedHost(pub String);

/// How a request reached the registry API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Addressed to a registry host (CONNECT interception or DNS override)
    Intercepted(String),
    /// Addressed to the proxy itself, Docker `registry-mirrors` style
    Mirror,
}

impl RequestOrigin {
    fn of(state: &AppState, req: &Request) -> Self {
        if let Some(InterceptedHost(host)) = req.extensions().get::<InterceptedHost>() {
            return RequestOrigin::Intercepted(host.clone());
        }
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host());
        match host {
            Some(host) if state.router.should_intercept(strip_port(host)) => {
                RequestOrigin::Intercepted(strip_port(host).to_string())
            }
            _ => RequestOrigin::Mirror,
        }
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map(|h| &h[1..]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// `ns` query parameter Docker sends to registry mirrors.
fn mirror_namespace(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "ns")
        .map(|(_, value)| value.to_string())
}

/// `GET /v2/`: the proxy authenticates upstream itself, so clients are
/// always admitted.
pub async fn api_version() -> Response {
    let mut response = (StatusCode::OK, "{}").into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "Docker-Distribution-API-Version",
        HeaderValue::from_static("registry/2.0"),
    );
    response
}

/// Entry point for every registry API request.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let origin = RequestOrigin::of(&state, &req);
    let path = req.uri().path().to_string();
    let decision = match &origin {
        RequestOrigin::Intercepted(host) => state.router.classify(host, &path),
        RequestOrigin::Mirror => {
            let ns = mirror_namespace(req.uri().query());
            state.router.classify_mirror(&path, ns.as_deref())
        }
    };

    let method = req.method().clone();
    let is_read = method == Method::GET || method == Method::HEAD;
    let head = method == Method::HEAD;

    tracing::debug!(
        method = %method,
        path = %path,
        origin = ?origin,
        kind = ?decision.kind,
        "Registry request"
    );

    let RouteDecision {
        registry,
        upstream_base_url,
        kind,
        cacheable,
    } = decision;
    let Some(registry) = registry else {
        return registry_error_response(
            StatusCode::NOT_FOUND,
            "NAME_UNKNOWN",
            "no registry serves this host",
        );
    };

    match kind {
        RouteKind::ApiVersion if is_read => api_version().await,
        RouteKind::Manifest {
            repository,
            reference,
        } if is_read && cacheable => {
            manifest::serve_manifest(state, registry, repository, reference, head).await
        }
        RouteKind::Blob { repository, digest } if is_read && cacheable => {
            blob::serve_blob(state, registry, repository, digest, head).await
        }
        _ => passthrough::forward(state, registry, upstream_base_url, origin, req).await,
    }
}
