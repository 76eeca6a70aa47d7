use crate::cache::CacheStats;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::proxy::serve_proxy;
use crate::registry::dispatch;
use crate::state::{AppState, ProxyStatsSnapshot};
use crate::tls::{install_crypto_provider, rustls_config_for_entry, rustls_config_from_files};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

/// Registry API only; served on intercepted TLS streams, where every path
/// belongs to the registry.
pub fn registry_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", any(dispatch))
        .route("/v2/*path", any(dispatch))
        .fallback(dispatch)
        .with_state(state)
}

/// Full router for the proxy, HTTPS and HTTP listeners: mirror-mode
/// registry API plus health, status and CA download.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2", any(dispatch))
        .route("/v2/", any(dispatch))
        .route("/v2/*path", any(dispatch))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/ca.crt", get(ca_certificate))
        .route("/api/v1/cache/stats", get(cache_stats))
        .route("/scripts/:name", get(script))
        .with_state(state)
}

/// Running listeners. Dropping the handle leaves them running; call
/// [`ServerHandle::shutdown`] to stop them.
pub struct ServerHandle {
    pub state: AppState,
    pub proxy_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub http_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Wait until any listener stops.
    pub async fn wait(self) {
        if self.tasks.is_empty() {
            return;
        }
        let (result, _, remaining) = futures::future::select_all(self.tasks).await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Listener task failed");
        }
        for task in remaining {
            task.abort();
        }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Open the cache and CA, bind every configured listener and start serving.
///
/// Ports set to `0` bind an ephemeral port; the bound addresses are on the
/// returned handle.
pub async fn start_server(config: Config) -> Result<ServerHandle> {
    install_crypto_provider();

    let bind_address = config.server.bind_address.clone();
    let proxy_port = config.server.proxy_port;
    let http_port = config.server.http_port;
    let tls = config.server.tls.clone().filter(|tls| tls.enabled);

    tracing::info!(
        cache_dir = %config.cache.directory,
        certs_dir = %config.certs.directory,
        max_size = config.cache.max_size,
        "Initializing registry proxy"
    );
    let state = AppState::new(config).await?;
    tracing::info!(
        objects = state.cache.object_count(),
        bytes = state.cache.total_size(),
        manifests = state.manifests.count(),
        registries = ?state.router.configured_registries(),
        "Cache and certificate authority ready"
    );

    let mut tasks = Vec::new();

    let proxy_addr = match proxy_port {
        Some(port) => {
            let listener = tokio::net::TcpListener::bind((bind_address.as_str(), port))
                .await
                .map_err(|e| bind_error("proxy", &bind_address, port, e))?;
            let addr = listener.local_addr()?;
            tracing::info!(addr = %addr, "Forward proxy listening");
            tasks.push(tokio::spawn(serve_proxy(
                listener,
                state.clone(),
                build_router(state.clone()),
            )));
            Some(addr)
        }
        None => None,
    };

    let https_addr = match tls {
        Some(tls_config) => {
            let rustls = if tls_config.cert_path.is_empty() || tls_config.key_path.is_empty() {
                let entry = state.ca.issue_server_certificate(&tls_config.hostnames).await?;
                tracing::info!(
                    hostnames = ?tls_config.hostnames,
                    "Using CA-issued certificate for HTTPS front"
                );
                rustls_config_for_entry(&entry)?
            } else {
                rustls_config_from_files(&tls_config)?
            };

            let listener = std::net::TcpListener::bind((bind_address.as_str(), tls_config.port))
                .map_err(|e| bind_error("HTTPS", &bind_address, tls_config.port, e))?;
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            tracing::info!(addr = %addr, "HTTPS listening");

            let app = build_router(state.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = axum_server::from_tcp_rustls(listener, rustls)
                    .serve(app.into_make_service())
                    .await
                {
                    tracing::error!(error = %e, "HTTPS server error");
                }
            }));
            Some(addr)
        }
        None => None,
    };

    let http_addr = match http_port {
        Some(port) => {
            let listener = tokio::net::TcpListener::bind((bind_address.as_str(), port))
                .await
                .map_err(|e| bind_error("HTTP", &bind_address, port, e))?;
            let addr = listener.local_addr()?;
            tracing::info!(addr = %addr, "HTTP listening");

            let app = build_router(state.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "HTTP server error");
                }
            }));
            Some(addr)
        }
        None => None,
    };

    if tasks.is_empty() {
        return Err(ProxyError::Config(
            "no listeners configured (proxy, HTTPS and HTTP ports all disabled)".to_string(),
        ));
    }

    Ok(ServerHandle {
        state,
        proxy_addr,
        https_addr,
        http_addr,
        tasks,
    })
}

fn bind_error(listener: &str, address: &str, port: u16, e: std::io::Error) -> ProxyError {
    ProxyError::Config(format!(
        "Failed to bind {} listener to {}:{}: {}",
        listener, address, port, e
    ))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /status
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.cache.stats();
    let proxy = state.stats.snapshot();
    let uptime = state.started_at.elapsed().as_secs();

    let mut out = String::new();
    out.push_str(&format!("regproxy {}\n", env!("CARGO_PKG_VERSION")));
    out.push_str(&format!("uptime: {}s\n", uptime));
    out.push_str(&format!(
        "cache: {} objects, {} of {} bytes\n",
        cache.objects, cache.total_bytes, cache.max_bytes
    ));
    out.push_str(&format!("manifests: {}\n", state.manifests.count()));
    out.push_str(&format!("in-flight fetches: {}\n", cache.in_flight));
    out.push_str(&format!("blob hits: {} misses: {}\n", cache.hits, cache.misses));
    out.push_str(&format!(
        "manifest hits: {} misses: {} revalidated: {} stale: {}\n",
        proxy.manifest_hits, proxy.manifest_misses, proxy.manifest_revalidated, proxy.manifest_stale
    ));
    out.push_str(&format!(
        "upstream fetches: {} bytes: {} requests: {} errors: {}\n",
        cache.upstream_fetches,
        cache.upstream_bytes,
        state.upstream.request_count(),
        proxy.upstream_errors
    ));
    out.push_str(&format!(
        "integrity failures: {} evicted: {} ({} bytes)\n",
        cache.integrity_failures, cache.evicted_objects, cache.evicted_bytes
    ));
    out.push_str(&format!("certificates issued: {}\n", state.ca.issued_count()));
    out.push_str(&format!(
        "connections: {} active, {} total, {} intercepted, {} tunneled\n",
        proxy.active_connections, proxy.connections, proxy.intercepted, proxy.tunneled
    ));
    out.push_str(&format!(
        "registries: {}\n",
        state.router.configured_registries().join(", ")
    ));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        out,
    )
}

/// GET /ca.crt
async fn ca_certificate(State(state): State<AppState>) -> Response {
    match state.ca.ca_certificate_pem().await {
        Ok(pem) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-x509-ca-cert"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"ca.crt\""),
            ],
            pem,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read CA certificate");
            (StatusCode::INTERNAL_SERVER_ERROR, "CA certificate unavailable").into_response()
        }
    }
}

#[derive(Serialize)]
struct CacheStatsResponse {
    #[serde(flatten)]
    cache: CacheStats,
    manifests: u64,
    certificates_issued: u64,
    upstream_requests: u64,
    proxy: ProxyStatsSnapshot,
}

/// GET /api/v1/cache/stats
async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(CacheStatsResponse {
        cache: state.cache.stats(),
        manifests: state.manifests.count(),
        certificates_issued: state.ca.issued_count(),
        upstream_requests: state.upstream.request_count(),
        proxy: state.stats.snapshot(),
    })
}

/// GET /scripts/:name
async fn script(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(dir) = state.config.server.scripts_dir.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !is_plain_file_name(&name) {
        return StatusCode::NOT_FOUND.into_response();
    }

    match tokio::fs::read(std::path::Path::new(dir).join(&name)).await {
        Ok(body) => {
            let content_type = if name.ends_with(".sh") {
                "text/x-shellscript"
            } else {
                "text/plain; charset=utf-8"
            };
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
                body,
            )
                .into_response()
        }
        Err(e) => {
            tracing::debug!(script = %name, error = %e, "Script not served");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_names_are_plain() {
        assert!(is_plain_file_name("install.sh"));
        assert!(is_plain_file_name("setup-docker_v2.ps1"));
        assert!(!is_plain_file_name("../ca.key"));
        assert!(!is_plain_file_name(".env"));
        assert!(!is_plain_file_name("a/b.sh"));
        assert!(!is_plain_file_name(""));
    }
}
