//! `CONNECT` handling on the forward-proxy port: registry hosts are
//! TLS-intercepted with a leaf from the proxy CA, everything else is tunneled.

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use regproxy::config::{Config, RegistryConfig};
use regproxy::{start_server, ServerHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const REGISTRY: &str = "registry.test";
const MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2},"layers":[]}"#;

async fn start_registry(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route(
            "/v2/*rest",
            get(|State(hits): State<Arc<AtomicUsize>>, uri: Uri| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                registry_response(uri.path())
            }),
        )
        .with_state(hits);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn registry_response(path: &str) -> Response {
    match path {
        "/v2/team/app/manifests/v1" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/vnd.oci.image.manifest.v1+json")],
            MANIFEST,
        )
            .into_response(),
        "/v2/team/app/tags/list" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"name":"team/app","tags":["v1"]}"#,
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, r#"{"errors":[]}"#).into_response(),
    }
}

/// Echo server standing in for a host the proxy does not intercept.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn start_proxy(dir: &TempDir, upstream: SocketAddr) -> ServerHandle {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.proxy_port = Some(0);
    config.server.http_port = None;
    config.server.tls = None;
    config.cache.directory = dir.path().join("cache").display().to_string();
    config.certs.directory = dir.path().join("certs").display().to_string();
    config.upstream.connect_timeout_secs = 2;
    config.upstream.registries.insert(
        REGISTRY.to_string(),
        RegistryConfig {
            mirrors: vec![format!("http://{}", upstream)],
            auth: None,
            insecure: false,
        },
    );
    start_server(config).await.unwrap()
}

/// Client that reaches HTTPS hosts through the proxy and trusts its CA.
async fn proxied_client(handle: &ServerHandle) -> reqwest::Client {
    let ca_pem = handle.state.ca.ca_certificate_pem().await.unwrap();
    let proxy = reqwest::Proxy::https(format!("http://{}", handle.proxy_addr.unwrap())).unwrap();
    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap())
        .build()
        .unwrap()
}

/// Send a raw `CONNECT` and return the proxy's status line plus the stream.
async fn connect_through(proxy: SocketAddr, target: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "proxy closed before finishing its response");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let status_line = head.lines().next().unwrap_or_default().to_string();
    (status_line, stream)
}

#[tokio::test]
async fn test_intercepted_pull_is_cached() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = start_registry(hits.clone()).await;
    let handle = start_proxy(&temp_dir, upstream).await;
    let client = proxied_client(&handle).await;
    let url = format!("https://{}/v2/team/app/manifests/v1", REGISTRY);

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(response.text().await.unwrap(), MANIFEST);

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(response.text().await.unwrap(), MANIFEST);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // API check and uncached calls are answered on the same intercepted host
    let response = client
        .get(format!("https://{}/v2/", REGISTRY))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .get(format!("https://{}/v2/team/app/tags/list", REGISTRY))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("\"v1\""));

    let stats = handle.state.stats.snapshot();
    assert!(stats.intercepted >= 1);
    assert_eq!(stats.tunneled, 0);
    assert!(temp_dir
        .path()
        .join("certs")
        .join("hosts")
        .join(format!("{}.json", REGISTRY))
        .exists());

    handle.shutdown();
}

#[tokio::test]
async fn test_untrusting_client_rejects_interception() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let upstream = start_registry(Arc::default()).await;
    let handle = start_proxy(&temp_dir, upstream).await;

    let proxy = reqwest::Proxy::https(format!("http://{}", handle.proxy_addr.unwrap())).unwrap();
    let client = reqwest::Client::builder().proxy(proxy).build().unwrap();
    let result = client
        .get(format!("https://{}/v2/team/app/manifests/v1", REGISTRY))
        .send()
        .await;
    assert!(result.is_err());

    handle.shutdown();
}

#[tokio::test]
async fn test_other_hosts_are_tunneled() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let upstream = start_registry(Arc::default()).await;
    let handle = start_proxy(&temp_dir, upstream).await;
    let echo = start_echo().await;

    let (status, mut stream) = connect_through(handle.proxy_addr.unwrap(), &echo.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"), "unexpected status {}", status);

    stream.write_all(b"opaque bytes").await.unwrap();
    let mut echoed = [0u8; 12];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"opaque bytes");

    assert_eq!(handle.state.stats.snapshot().tunneled, 1);
    assert_eq!(handle.state.ca.issued_count(), 0);

    handle.shutdown();
}

#[tokio::test]
async fn test_unreachable_tunnel_target() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let upstream = start_registry(Arc::default()).await;
    let handle = start_proxy(&temp_dir, upstream).await;

    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (status, _) = connect_through(handle.proxy_addr.unwrap(), &closed.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 502"), "unexpected status {}", status);

    handle.shutdown();
}
