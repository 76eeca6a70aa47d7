use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Root CA material cannot be loaded or generated. Fatal at startup.
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Integrity error: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid repository name: {0}")]
    InvalidName(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("Upstream not found: {0}")]
    UpstreamNotFound(String),

    #[error("Upstream returned {status}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Registry error: {0}")]
    Registry(String),
}

impl ProxyError {
    /// Rebuild an equivalent error so one result can be handed to every
    /// waiter of a deduplicated fetch. Source errors that are not `Clone`
    /// (`io`, `reqwest`, `serde_json`) keep their message.
    pub fn duplicate(&self) -> ProxyError {
        match self {
            ProxyError::Io(e) => ProxyError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ProxyError::Config(msg) => ProxyError::Config(msg.clone()),
            ProxyError::KeyMaterial(msg) => ProxyError::KeyMaterial(msg.clone()),
            ProxyError::Tls(msg) => ProxyError::Tls(msg.clone()),
            ProxyError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    ProxyError::UpstreamUnavailable(e.to_string())
                } else {
                    ProxyError::Registry(e.to_string())
                }
            }
            ProxyError::Serialization(e) => ProxyError::Cache(e.to_string()),
            ProxyError::Cache(msg) => ProxyError::Cache(msg.clone()),
            ProxyError::Integrity { expected, actual } => ProxyError::Integrity {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            ProxyError::InvalidDigest(msg) => ProxyError::InvalidDigest(msg.clone()),
            ProxyError::InvalidName(msg) => ProxyError::InvalidName(msg.clone()),
            ProxyError::InvalidTag(msg) => ProxyError::InvalidTag(msg.clone()),
            ProxyError::UpstreamUnavailable(msg) => ProxyError::UpstreamUnavailable(msg.clone()),
            ProxyError::UpstreamAuth(msg) => ProxyError::UpstreamAuth(msg.clone()),
            ProxyError::UpstreamNotFound(msg) => ProxyError::UpstreamNotFound(msg.clone()),
            ProxyError::UpstreamStatus { status, body } => ProxyError::UpstreamStatus {
                status: *status,
                body: body.clone(),
            },
            ProxyError::Registry(msg) => ProxyError::Registry(msg.clone()),
        }
    }

    /// Whether a cached copy may be served in place of this failure.
    pub fn allows_stale(&self) -> bool {
        matches!(self, ProxyError::UpstreamUnavailable(_))
    }

    /// Map to the closest registry API error for the given resource kind.
    pub fn to_registry_response(&self, resource: ResourceKind) -> Response {
        let (status, code) = match self {
            ProxyError::UpstreamNotFound(_) => (StatusCode::NOT_FOUND, resource.unknown_code()),
            ProxyError::UpstreamAuth(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ProxyError::UpstreamUnavailable(_) | ProxyError::Http(_) => {
                (StatusCode::BAD_GATEWAY, "UNAVAILABLE")
            }
            ProxyError::Integrity { .. } => (StatusCode::BAD_GATEWAY, "DIGEST_INVALID"),
            ProxyError::InvalidDigest(_) => (StatusCode::BAD_REQUEST, "DIGEST_INVALID"),
            ProxyError::InvalidName(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
            ProxyError::InvalidTag(_) => (StatusCode::BAD_REQUEST, "TAG_INVALID"),
            ProxyError::UpstreamStatus { status, body } => {
                let status =
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                // Registry envelopes from upstream are relayed as-is.
                if body.trim_start().starts_with("{\"errors\"") {
                    let mut response = (status, body.clone()).into_response();
                    response.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    return response;
                }
                (status, status_code_name(status))
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
        };
        registry_error_response(status, code, &self.to_string())
    }
}

/// Which registry resource a request addressed; selects the `*_UNKNOWN` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Manifest,
    Blob,
    Other,
}

impl ResourceKind {
    fn unknown_code(self) -> &'static str {
        match self {
            ResourceKind::Manifest => "MANIFEST_UNKNOWN",
            ResourceKind::Blob => "BLOB_UNKNOWN",
            ResourceKind::Other => "NAME_UNKNOWN",
        }
    }
}

fn status_code_name(status: StatusCode) -> &'static str {
    match status.as_u16() {
        401 => "UNAUTHORIZED",
        403 => "DENIED",
        404 => "NAME_UNKNOWN",
        429 => "TOOMANYREQUESTS",
        _ => "UNKNOWN",
    }
}

#[derive(Serialize)]
struct RegistryErrors<'a> {
    errors: Vec<RegistryErrorBody<'a>>,
}

#[derive(Serialize)]
struct RegistryErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    detail: Option<serde_json::Value>,
}

/// Registry error envelope: `{"errors":[{"code","message","detail"}]}`.
pub fn registry_error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = RegistryErrors {
        errors: vec![RegistryErrorBody {
            code,
            message,
            detail: None,
        }],
    };
    let json = serde_json::to_string(&body)
        .unwrap_or_else(|_| format!("{{\"errors\":[{{\"code\":\"{}\"}}]}}", code));
    let mut response = (status, json).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_registry_response(ResourceKind::Other)
    }
}
