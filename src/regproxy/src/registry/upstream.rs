use crate::cache::BlobStream;
use crate::config::{RegistryAuth, UpstreamConfig};
use crate::dns::ipv4_prefer_resolver;
use crate::error::{ProxyError, Result};
use crate::registry::auth::{fetch_token, parse_challenge, Challenge, TokenCache};
use crate::registry::route::RegistryId;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

/// Upstream error bodies larger than this are truncated
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Delay before the single retry of a failed connection
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Where a registry's requests go.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub registry: RegistryId,
    /// Base URLs in failover order
    pub mirrors: Vec<String>,
    pub auth: Option<RegistryAuth>,
    pub insecure: bool,
}

/// One registry API request, relative to a mirror base URL.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path and query, e.g. `/v2/library/nginx/manifests/latest`
    pub path: String,
    pub headers: HeaderMap,
    /// Repository for the default `repository:<name>:pull` token scope
    pub repository: Option<String>,
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            repository: None,
            body: None,
        }
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn default_scope(&self) -> String {
        self.repository
            .as_ref()
            .map(|r| format!("repository:{}:pull", r))
            .unwrap_or_default()
    }
}

/// Upstream response with headers available and the body still streaming.
pub struct StreamedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: BlobStream,
}

impl StreamedResponse {
    /// Collect the whole body. Manifests and error bodies only.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// HTTP client for upstream registries: token auth, mirror failover,
/// idle-read timeout.
pub struct UpstreamClient {
    client: Client,
    insecure_client: Client,
    tokens: RwLock<TokenCache>,
    /// mirror + default scope -> token cache key, to send a known token up front
    session_hints: Mutex<HashMap<String, String>>,
    idle_timeout: Duration,
    requests: AtomicU64,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config, false)?,
            insecure_client: build_client(config, true)?,
            tokens: RwLock::new(TokenCache::new()),
            session_hints: Mutex::new(HashMap::new()),
            idle_timeout: Duration::from_secs(config.idle_read_timeout_secs.max(1)),
            requests: AtomicU64::new(0),
        })
    }

    /// Requests sent upstream, token requests excluded.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn client_for(&self, target: &UpstreamTarget) -> &Client {
        if target.insecure {
            &self.insecure_client
        } else {
            &self.client
        }
    }

    /// Send `request` to the target's mirrors in order and map the status:
    /// success and `304` are returned, `404` is `UpstreamNotFound`, `5xx` and
    /// connection failures are `UpstreamUnavailable` (next mirror is tried),
    /// anything else is `UpstreamStatus`.
    pub async fn fetch(&self, target: &UpstreamTarget, request: &UpstreamRequest) -> Result<StreamedResponse> {
        let mut last_error = None;

        for mirror in &target.mirrors {
            let result = match self.send_authenticated(target, mirror, request).await {
                Ok(response) => self.classify_status(mirror, request, response).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e @ ProxyError::UpstreamUnavailable(_)) => {
                    tracing::warn!(
                        registry = %target.registry,
                        mirror = %mirror,
                        path = %request.path,
                        error = %e,
                        "Upstream mirror unavailable"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProxyError::UpstreamUnavailable(format!("no mirrors configured for {}", target.registry))
        }))
    }

    /// Send `request` to the first mirror and return the response whatever
    /// its status. Used for uncached pass-through calls.
    pub async fn forward(&self, target: &UpstreamTarget, request: &UpstreamRequest) -> Result<StreamedResponse> {
        let mirror = target.mirrors.first().ok_or_else(|| {
            ProxyError::UpstreamUnavailable(format!("no mirrors configured for {}", target.registry))
        })?;
        let response = self.send_authenticated(target, mirror, request).await?;
        Ok(self.into_streamed(response))
    }

    async fn classify_status(
        &self,
        mirror: &str,
        request: &UpstreamRequest,
        response: reqwest::Response,
    ) -> Result<StreamedResponse> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(self.into_streamed(response));
        }

        let body = read_error_body(response).await;
        let context = format!("{}{} returned {}", mirror, request.path, status);
        Err(match status {
            StatusCode::NOT_FOUND => ProxyError::UpstreamNotFound(context),
            StatusCode::UNAUTHORIZED => ProxyError::UpstreamAuth(context),
            s if s.is_server_error() => ProxyError::UpstreamUnavailable(context),
            s => ProxyError::UpstreamStatus {
                status: s.as_u16(),
                body,
            },
        })
    }

    fn into_streamed(&self, response: reqwest::Response) -> StreamedResponse {
        let status = response.status();
        let headers = response.headers().clone();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let idle = self.idle_timeout;
        let body = tokio_stream::StreamExt::timeout(response.bytes_stream(), idle)
            .map(move |item| match item {
                Ok(Ok(chunk)) => Ok(chunk),
                Ok(Err(e)) => Err(ProxyError::UpstreamUnavailable(format!(
                    "upstream transfer failed: {}",
                    e
                ))),
                Err(_) => Err(ProxyError::UpstreamUnavailable(format!(
                    "no data from upstream for {}s",
                    idle.as_secs()
                ))),
            })
            .boxed();
        StreamedResponse {
            status,
            headers,
            content_length,
            body,
        }
    }

    /// Send with whatever credentials the registry wants: a cached bearer
    /// token up front, then one token exchange on `401`.
    async fn send_authenticated(
        &self,
        target: &UpstreamTarget,
        mirror: &str,
        request: &UpstreamRequest,
    ) -> Result<reqwest::Response> {
        let client = self.client_for(target);
        let url = format!("{}{}", mirror.trim_end_matches('/'), request.path);
        let hint_key = format!("{}|{}", mirror, request.default_scope());

        let mut sent_session = None;
        let hinted = {
            let hints = self.session_hints.lock().unwrap_or_else(|e| e.into_inner());
            hints.get(&hint_key).cloned()
        };
        let mut credential = None;
        if let Some(key) = hinted {
            if let Some(session) = self.tokens.read().await.get(&key) {
                credential = Some(Credential::Bearer(session.token));
                sent_session = Some(key);
            }
        }

        let response = self
            .send_with_retry(client, request, &url, credential.as_ref())
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);

        let credential = match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope = scope.unwrap_or_else(|| request.default_scope());
                let key = TokenCache::key(&realm, service.as_deref(), &scope);

                let cached = if sent_session.as_deref() == Some(key.as_str()) {
                    // The token we sent was rejected
                    self.tokens.write().await.invalidate(&key);
                    None
                } else {
                    self.tokens.read().await.get(&key)
                };

                let session = match cached {
                    Some(session) => session,
                    None => {
                        let session = fetch_token(
                            client,
                            target.registry.name(),
                            &realm,
                            service.as_deref(),
                            &scope,
                            target.auth.as_ref(),
                        )
                        .await?;
                        self.tokens.write().await.insert(key.clone(), session.clone());
                        session
                    }
                };

                self.session_hints
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(hint_key, key);
                Credential::Bearer(session.token)
            }
            Some(Challenge::Basic { .. }) => match target.auth.as_ref() {
                Some(auth) => Credential::Basic(auth.clone()),
                None => {
                    return Err(ProxyError::UpstreamAuth(format!(
                        "{} requires credentials",
                        target.registry
                    )))
                }
            },
            None => {
                return Err(ProxyError::UpstreamAuth(format!(
                    "{} returned 401 without a usable challenge",
                    url
                )))
            }
        };

        let response = self
            .send_with_retry(client, request, &url, Some(&credential))
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProxyError::UpstreamAuth(format!(
                "{} rejected credentials for {}",
                target.registry, request.path
            )));
        }
        Ok(response)
    }

    async fn send_with_retry(
        &self,
        client: &Client,
        request: &UpstreamRequest,
        url: &str,
        credential: Option<&Credential>,
    ) -> Result<reqwest::Response> {
        let mut attempt = 1;
        loop {
            let mut builder = client
                .request(request.method.clone(), url)
                .headers(request.headers.clone());
            builder = match credential {
                Some(Credential::Bearer(token)) => builder.bearer_auth(token),
                Some(Credential::Basic(auth)) => {
                    builder.basic_auth(&auth.username, Some(&auth.password))
                }
                None => builder,
            };
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            self.requests.fetch_add(1, Ordering::Relaxed);
            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt == 1 && (e.is_connect() || e.is_timeout()) => {
                    tracing::debug!(url = %url, error = %e, "Upstream request failed, retrying once");
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ProxyError::UpstreamUnavailable(format!(
                        "request to {} failed: {}",
                        url, e
                    )))
                }
            }
        }
    }
}

/// Credentials attached to an upstream request.
#[derive(Debug, Clone)]
enum Credential {
    Bearer(String),
    Basic(RegistryAuth),
}

async fn read_error_body(response: reqwest::Response) -> String {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    while let Some(Ok(chunk)) = stream.next().await {
        body.extend_from_slice(&chunk);
        if body.len() >= MAX_ERROR_BODY {
            body.truncate(MAX_ERROR_BODY);
            break;
        }
    }
    String::from_utf8_lossy(&body).to_string()
}

fn build_client(config: &UpstreamConfig, insecure: bool) -> Result<Client> {
    let tls = config.tls.as_ref();
    let mut builder = Client::builder()
        .redirect(reqwest::redirect::Policy::limited(1))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .danger_accept_invalid_certs(insecure || tls.is_some_and(|t| t.insecure_skip_verify))
        .no_proxy();

    if config.prefer_ipv4 {
        builder = builder.dns_resolver(ipv4_prefer_resolver());
    }

    if let Some(proxy) = config.http_proxy.as_deref() {
        builder = builder.proxy(
            reqwest::Proxy::http(proxy)
                .map_err(|e| ProxyError::Config(format!("Invalid HTTP_PROXY '{}': {}", proxy, e)))?,
        );
    }
    if let Some(proxy) = config.https_proxy.as_deref() {
        builder = builder.proxy(
            reqwest::Proxy::https(proxy)
                .map_err(|e| ProxyError::Config(format!("Invalid HTTPS_PROXY '{}': {}", proxy, e)))?,
        );
    }

    if let Some(bundle) = tls.and_then(|t| t.ca_bundle_path.as_deref()) {
        let pem = std::fs::read(bundle)
            .map_err(|e| ProxyError::Config(format!("Failed to read CA bundle {}: {}", bundle, e)))?;
        let mut reader = std::io::Cursor::new(pem);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert
                .map_err(|e| ProxyError::Config(format!("Invalid CA bundle {}: {}", bundle, e)))?;
            let cert = reqwest::Certificate::from_der(cert.as_ref())
                .map_err(|e| ProxyError::Config(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    builder.build().map_err(ProxyError::Http)
}
