//! Upstream client against mock registries: bearer token exchange, basic
//! credentials, status mapping, mirror failover, redirects and stalled bodies.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use regproxy::config::{RegistryAuth, UpstreamConfig};
use regproxy::error::ProxyError;
use regproxy::registry::{RegistryId, UpstreamClient, UpstreamRequest, UpstreamTarget};
use reqwest::Method;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#;

#[derive(Clone, Default)]
struct MockState {
    token_requests: Arc<AtomicUsize>,
    manifest_requests: Arc<AtomicUsize>,
    /// Query and Authorization header of every token request
    token_calls: Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>>,
}

async fn bind() -> (tokio::net::TcpListener, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn serve(listener: tokio::net::TcpListener, app: Router) {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// Registry that wants a bearer token from its own `/token` endpoint.
async fn start_token_registry(state: MockState) -> SocketAddr {
    let (listener, addr) = bind().await;
    let realm = format!("http://{}/token", addr);

    let app = Router::new()
        .route(
            "/token",
            get(
                |State(state): State<MockState>,
                 Query(query): Query<HashMap<String, String>>,
                 headers: HeaderMap| async move {
                    state.token_requests.fetch_add(1, Ordering::SeqCst);
                    let authorization = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    state.token_calls.lock().unwrap().push((query, authorization));
                    Json(serde_json::json!({ "token": "mock-token", "expires_in": 300 }))
                },
            ),
        )
        .route(
            "/v2/*rest",
            get(move |State(state): State<MockState>, headers: HeaderMap| {
                let realm = realm.clone();
                async move {
                    state.manifest_requests.fetch_add(1, Ordering::SeqCst);
                    let authorized = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer mock-token");
                    if authorized {
                        (StatusCode::OK, HeaderMap::new(), MANIFEST).into_response()
                    } else {
                        let challenge = format!(
                            r#"Bearer realm="{}",service="mock-registry",scope="repository:library/nginx:pull""#,
                            realm
                        );
                        (
                            StatusCode::UNAUTHORIZED,
                            [(header::WWW_AUTHENTICATE, challenge)],
                            "",
                        )
                            .into_response()
                    }
                }
            }),
        )
        .with_state(state);

    serve(listener, app);
    addr
}

/// Registry answering every `/v2/` request with `status`.
async fn start_status_registry(status: StatusCode, hits: Arc<AtomicUsize>) -> SocketAddr {
    let (listener, addr) = bind().await;
    let app = Router::new().route(
        "/v2/*rest",
        get(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if status == StatusCode::OK {
                    (status, MANIFEST.to_string())
                } else {
                    (status, r#"{"errors":[{"code":"MOCK","message":"mock"}]}"#.to_string())
                }
            }
        }),
    );
    serve(listener, app);
    addr
}

/// Address nothing listens on.
async fn closed_port() -> SocketAddr {
    let (listener, addr) = bind().await;
    drop(listener);
    addr
}

fn target(mirrors: &[SocketAddr], auth: Option<RegistryAuth>) -> UpstreamTarget {
    UpstreamTarget {
        registry: RegistryId::Custom("mock.test".to_string()),
        mirrors: mirrors.iter().map(|addr| format!("http://{}", addr)).collect(),
        auth,
        insecure: false,
    }
}

fn manifest_request() -> UpstreamRequest {
    UpstreamRequest::new(Method::GET, "/v2/library/nginx/manifests/latest").repository("library/nginx")
}

fn client() -> UpstreamClient {
    let config = UpstreamConfig {
        connect_timeout_secs: 2,
        ..UpstreamConfig::default()
    };
    UpstreamClient::new(&config).unwrap()
}

#[tokio::test]
async fn test_bearer_token_exchange_and_reuse() {
    let state = MockState::default();
    let addr = start_token_registry(state.clone()).await;
    let client = client();
    let target = target(&[addr], None);

    let body = client
        .fetch(&target, &manifest_request())
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body, MANIFEST.as_bytes());
    assert_eq!(state.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(state.manifest_requests.load(Ordering::SeqCst), 2);

    {
        let calls = state.token_calls.lock().unwrap();
        let (query, authorization) = &calls[0];
        assert_eq!(query.get("service").map(String::as_str), Some("mock-registry"));
        assert_eq!(
            query.get("scope").map(String::as_str),
            Some("repository:library/nginx:pull")
        );
        // Anonymous pull
        assert_eq!(authorization, &None);
    }

    // The cached token is sent up front on the next call
    let response = client.fetch(&target, &manifest_request()).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(state.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(state.manifest_requests.load(Ordering::SeqCst), 3);
    assert_eq!(client.request_count(), 3);
}

#[tokio::test]
async fn test_token_request_carries_configured_credentials() {
    let state = MockState::default();
    let addr = start_token_registry(state.clone()).await;
    let client = client();
    let auth = RegistryAuth {
        username: "bot".to_string(),
        password: "secret".to_string(),
    };

    client
        .fetch(&target(&[addr], Some(auth)), &manifest_request())
        .await
        .unwrap();

    let calls = state.token_calls.lock().unwrap();
    let authorization = calls[0].1.as_deref().unwrap();
    // base64("bot:secret")
    assert_eq!(authorization, "Basic Ym90OnNlY3JldA==");
}

#[tokio::test]
async fn test_basic_challenge_uses_credentials() {
    let (listener, addr) = bind().await;
    let app = Router::new().route(
        "/v2/*rest",
        get(|headers: HeaderMap| async move {
            let authorization = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if authorization == Some("Basic Ym90OnNlY3JldA==") {
                (StatusCode::OK, HeaderMap::new(), MANIFEST).into_response()
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, r#"Basic realm="mock""#)],
                    "",
                )
                    .into_response()
            }
        }),
    );
    serve(listener, app);

    let client = client();
    let auth = RegistryAuth {
        username: "bot".to_string(),
        password: "secret".to_string(),
    };
    let response = client
        .fetch(&target(&[addr], Some(auth)), &manifest_request())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);

    // Without credentials the challenge cannot be answered
    let result = client.fetch(&target(&[addr], None), &manifest_request()).await;
    assert!(matches!(result, Err(ProxyError::UpstreamAuth(_))));
}

#[tokio::test]
async fn test_status_mapping() {
    let client = client();

    let not_found = start_status_registry(StatusCode::NOT_FOUND, Arc::default()).await;
    let result = client.fetch(&target(&[not_found], None), &manifest_request()).await;
    assert!(matches!(result, Err(ProxyError::UpstreamNotFound(_))));

    let denied = start_status_registry(StatusCode::FORBIDDEN, Arc::default()).await;
    match client.fetch(&target(&[denied], None), &manifest_request()).await {
        Err(ProxyError::UpstreamStatus { status, body }) => {
            assert_eq!(status, 403);
            assert!(body.contains("MOCK"));
        }
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("403 returned as success"),
    }

    let failing = start_status_registry(StatusCode::SERVICE_UNAVAILABLE, Arc::default()).await;
    let result = client.fetch(&target(&[failing], None), &manifest_request()).await;
    assert!(matches!(result, Err(ProxyError::UpstreamUnavailable(_))));

    let unreachable = closed_port().await;
    let result = client.fetch(&target(&[unreachable], None), &manifest_request()).await;
    assert!(matches!(result, Err(ProxyError::UpstreamUnavailable(_))));
}

#[tokio::test]
async fn test_mirror_failover() {
    let client = client();
    let failing_hits = Arc::new(AtomicUsize::new(0));
    let healthy_hits = Arc::new(AtomicUsize::new(0));
    let failing = start_status_registry(StatusCode::BAD_GATEWAY, failing_hits.clone()).await;
    let healthy = start_status_registry(StatusCode::OK, healthy_hits.clone()).await;
    let unreachable = closed_port().await;

    let response = client
        .fetch(&target(&[unreachable, failing, healthy], None), &manifest_request())
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap(), MANIFEST.as_bytes());
    assert_eq!(failing_hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_hits.load(Ordering::SeqCst), 1);

    // A definitive answer stops the walk
    let missing_hits = Arc::new(AtomicUsize::new(0));
    let missing = start_status_registry(StatusCode::NOT_FOUND, missing_hits.clone()).await;
    let untouched = Arc::new(AtomicUsize::new(0));
    let spare = start_status_registry(StatusCode::OK, untouched.clone()).await;
    let result = client.fetch(&target(&[missing, spare], None), &manifest_request()).await;
    assert!(matches!(result, Err(ProxyError::UpstreamNotFound(_))));
    assert_eq!(missing_hits.load(Ordering::SeqCst), 1);
    assert_eq!(untouched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_forward_relays_any_status() {
    let client = client();
    let addr = start_status_registry(StatusCode::NOT_FOUND, Arc::default()).await;

    let request = UpstreamRequest::new(Method::GET, "/v2/library/nginx/tags/list");
    let response = client.forward(&target(&[addr], None), &request).await.unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    let body = response.bytes().await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("errors"));
}

#[tokio::test]
async fn test_stalled_body_times_out() {
    let (listener, addr) = bind().await;
    let app = Router::new().route(
        "/v2/*rest",
        get(|| async {
            let first = futures::stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"{\"schemaVersion\":"))
            });
            // Headers and a first chunk, then nothing
            let body = Body::from_stream(first.chain(futures::stream::pending()));
            (StatusCode::OK, body)
        }),
    );
    serve(listener, app);

    let config = UpstreamConfig {
        connect_timeout_secs: 2,
        idle_read_timeout_secs: 1,
        ..UpstreamConfig::default()
    };
    let client = UpstreamClient::new(&config).unwrap();

    let response = client
        .fetch(&target(&[addr], None), &manifest_request())
        .await
        .unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(10), response.bytes())
        .await
        .expect("idle timeout never fired");
    assert!(matches!(result, Err(ProxyError::UpstreamUnavailable(_))));
}

#[tokio::test]
async fn test_follows_one_redirect_only() {
    let (listener, addr) = bind().await;
    let app = Router::new()
        .route(
            "/v2/library/nginx/manifests/latest",
            get(|| async { Redirect::temporary("/storage/manifest") }),
        )
        .route(
            "/v2/library/nginx/manifests/twice",
            get(|| async { Redirect::temporary("/v2/library/nginx/manifests/latest") }),
        )
        .route("/storage/manifest", get(|| async { (StatusCode::OK, MANIFEST) }));
    serve(listener, app);
    let client = client();

    let response = client
        .fetch(&target(&[addr], None), &manifest_request())
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap(), MANIFEST.as_bytes());

    let request = UpstreamRequest::new(Method::GET, "/v2/library/nginx/manifests/twice")
        .repository("library/nginx");
    let result = client.fetch(&target(&[addr], None), &request).await;
    assert!(matches!(result, Err(ProxyError::UpstreamUnavailable(_))));
}
