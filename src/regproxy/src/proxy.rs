//! Forward-proxy listener.
//!
//! `CONNECT` to a registry host is answered locally: the client's TLS is
//! terminated with a leaf from our CA and the registry API is served over
//! the decrypted stream. Any other `CONNECT` is tunneled byte-for-byte.
//! Plain HTTP requests on the proxy port go to the regular router.

use crate::dns::resolve_host;
use crate::error::{ProxyError, Result};
use crate::registry::InterceptedHost;
use crate::server::registry_router;
use crate::state::{AppState, ConnectionGuard, ProxyStats};
use crate::tls::server_config_from_pem;
use axum::{
    http::{uri::Authority, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

/// Accept proxy connections until the task is aborted. `app` serves plain
/// (non-`CONNECT`) requests.
pub async fn serve_proxy(listener: TcpListener, state: AppState, app: Router) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept proxy connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let state = state.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let _guard = ConnectionGuard::new(state.stats.clone());
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let state = state.clone();
                let app = app.clone();
                async move { Ok::<_, Infallible>(handle(state, app, peer, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "Proxy connection closed with error");
            }
        });
    }
}

async fn handle(state: AppState, app: Router, peer: SocketAddr, req: hyper::Request<Incoming>) -> Response {
    if req.method() != Method::CONNECT {
        return match app.oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
    }

    let Some(authority) = req.uri().authority().cloned() else {
        return (StatusCode::BAD_REQUEST, "CONNECT requires host:port").into_response();
    };

    if state.router.should_intercept(authority.as_str()) {
        intercept(state, peer, authority, req).await
    } else {
        tunnel(state, peer, authority, req).await
    }
}

fn connect_host(authority: &Authority) -> &str {
    authority.host().trim_start_matches('[').trim_end_matches(']')
}

async fn intercept(
    state: AppState,
    peer: SocketAddr,
    authority: Authority,
    req: hyper::Request<Incoming>,
) -> Response {
    let host = connect_host(&authority).to_string();

    // The leaf is ready before the client is told to start TLS
    let tls = match state
        .ca
        .ensure_certificate(&host)
        .await
        .and_then(|entry| server_config_from_pem(&entry.cert_pem, &entry.key_pem))
    {
        Ok(tls) => tls,
        Err(e) => {
            tracing::error!(host = %host, error = %e, "Cannot issue interception certificate");
            return (StatusCode::BAD_GATEWAY, format!("certificate for {} unavailable", host))
                .into_response();
        }
    };

    tracing::debug!(peer = %peer, host = %authority, "Intercepting registry connection");
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(peer = %peer, host = %authority, error = %e, "CONNECT upgrade failed");
                return;
            }
        };
        if let Err(e) = serve_intercepted(state, TokioIo::new(upgraded), tls, authority.to_string()).await {
            tracing::debug!(peer = %peer, host = %authority, error = %e, "Intercepted connection ended");
        }
    });

    StatusCode::OK.into_response()
}

/// Terminate TLS on `io` and serve the registry API for `host` over it.
pub async fn serve_intercepted<IO>(
    state: AppState,
    io: IO,
    tls: Arc<rustls::ServerConfig>,
    host: String,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stream = TlsAcceptor::from(tls)
        .accept(io)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake for {} failed: {}", host, e)))?;
    ProxyStats::incr(&state.stats.intercepted);

    let app = registry_router(state);
    let service = service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(InterceptedHost(host.clone()));
        app.clone().oneshot(req)
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
        .map_err(|e| ProxyError::Io(std::io::Error::other(e)))
}

async fn tunnel(
    state: AppState,
    peer: SocketAddr,
    authority: Authority,
    req: hyper::Request<Incoming>,
) -> Response {
    let host = connect_host(&authority).to_string();
    let port = authority.port_u16().unwrap_or(443);
    let prefer_ipv4 = state.config.upstream.prefer_ipv4;

    // Connect first so an unreachable target is reported as 502
    let connect = async {
        let addrs = resolve_host(&host, port, prefer_ipv4).await?;
        TcpStream::connect(&addrs[..]).await
    };
    let timeout = Duration::from_secs(state.config.upstream.connect_timeout_secs.max(1));
    let mut target = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(host = %authority, error = %e, "Tunnel target unreachable");
            return (StatusCode::BAD_GATEWAY, format!("cannot reach {}", authority)).into_response();
        }
        Err(_) => {
            tracing::warn!(host = %authority, "Tunnel connect timed out");
            return (StatusCode::GATEWAY_TIMEOUT, format!("timed out connecting to {}", authority))
                .into_response();
        }
    };

    ProxyStats::incr(&state.stats.tunneled);
    tracing::debug!(peer = %peer, host = %authority, "Tunneling connection");
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(peer = %peer, host = %authority, error = %e, "CONNECT upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        match tokio::io::copy_bidirectional(&mut client, &mut target).await {
            Ok((sent, received)) => {
                tracing::debug!(host = %authority, sent = sent, received = received, "Tunnel closed")
            }
            Err(e) => tracing::debug!(host = %authority, error = %e, "Tunnel closed with error"),
        }
    });

    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_host_strips_brackets() {
        let authority: Authority = "[::1]:8443".parse().unwrap();
        assert_eq!(connect_host(&authority), "::1");
        let authority: Authority = "ghcr.io:443".parse().unwrap();
        assert_eq!(connect_host(&authority), "ghcr.io");
    }
}
