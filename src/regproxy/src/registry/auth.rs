use crate::config::{RegistryAuth, DEFAULT_TOKEN_EXPIRY_SECS, TOKEN_EXPIRY_SAFETY_MARGIN_SECS};
use crate::error::{ProxyError, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

/// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
/// Quoted values may contain commas (`scope="repository:a:pull,push"`).
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = match header.split_once(char::is_whitespace) {
        Some((scheme, params)) => (scheme, params),
        None => (header, ""),
    };
    let params = parse_params(params);

    if scheme.eq_ignore_ascii_case("bearer") {
        let realm = params.get("realm")?.clone();
        Some(Challenge::Bearer {
            realm,
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    } else if scheme.eq_ignore_ascii_case("basic") {
        Some(Challenge::Basic {
            realm: params.get("realm").cloned(),
        })
    } else {
        None
    }
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars
            .by_ref()
            .take_while(|c| *c != '=')
            .collect::<String>()
            .trim()
            .to_ascii_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        params.insert(key, value);
    }
    params
}

/// Bearer token obtained for one realm/service/scope.
#[derive(Debug, Clone)]
pub struct RegistrySession {
    pub host: String,
    pub token: String,
    pub expires_at: Instant,
    pub scope: String,
}

impl RegistrySession {
    pub fn is_valid(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

#[derive(Default)]
pub struct TokenCache {
    sessions: HashMap<String, RegistrySession>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn key(realm: &str, service: Option<&str>, scope: &str) -> String {
        format!("{}|{}|{}", realm, service.unwrap_or(""), scope)
    }

    pub fn get(&self, key: &str) -> Option<RegistrySession> {
        self.sessions.get(key).filter(|s| s.is_valid()).cloned()
    }

    pub fn insert(&mut self, key: String, session: RegistrySession) {
        self.sessions.insert(key, session);
        self.sessions.retain(|_, s| s.is_valid());
    }

    pub fn invalidate(&mut self, key: &str) {
        self.sessions.remove(key);
    }
}

/// Session lifetime: `expires_in` (default 300 s) minus a 30 s margin.
pub fn session_expiry(expires_in: Option<u64>) -> Instant {
    let expires_in = expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
    Instant::now() + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS))
}

/// Request a token from the challenge's realm. Anonymous unless
/// `credentials` are configured for the registry.
pub async fn fetch_token(
    client: &Client,
    host: &str,
    realm: &str,
    service: Option<&str>,
    scope: &str,
    credentials: Option<&RegistryAuth>,
) -> Result<RegistrySession> {
    let mut url = reqwest::Url::parse(realm)
        .map_err(|e| ProxyError::UpstreamAuth(format!("invalid token realm '{}': {}", realm, e)))?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = service {
            query.append_pair("service", service);
        }
        if !scope.is_empty() {
            query.append_pair("scope", scope);
        }
    }

    let mut request = client.get(url.clone());
    if let Some(credentials) = credentials {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let response = request.send().await.map_err(|e| {
        ProxyError::UpstreamUnavailable(format!("token request to {} failed: {}", url, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::UpstreamAuth(format!(
            "token endpoint {} returned {}",
            realm, status
        )));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamAuth(format!("invalid token response: {}", e)))?;

    // Docker Hub uses "token", some registries only "access_token"
    let token = json
        .get("token")
        .and_then(|t| t.as_str())
        .or_else(|| json.get("access_token").and_then(|t| t.as_str()))
        .ok_or_else(|| ProxyError::UpstreamAuth("token response without token".to_string()))?;
    let expires_in = json.get("expires_in").and_then(|v| v.as_u64());

    tracing::debug!(host = %host, scope = %scope, expires_in = ?expires_in, "Obtained registry token");

    Ok(RegistrySession {
        host: host.to_string(),
        token: token.to_string(),
        expires_at: session_expiry(expires_in),
        scope: scope.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_hub_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        assert_eq!(
            parse_challenge(header),
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull".to_string()),
            })
        );
    }

    #[test]
    fn scope_may_contain_commas() {
        let header = r#"Bearer realm="https://ghcr.io/token", scope="repository:org/app:pull,push""#;
        match parse_challenge(header) {
            Some(Challenge::Bearer { scope, service, .. }) => {
                assert_eq!(scope.as_deref(), Some("repository:org/app:pull,push"));
                assert_eq!(service, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_basic_and_rejects_unknown() {
        assert_eq!(
            parse_challenge(r#"Basic realm="Registry""#),
            Some(Challenge::Basic {
                realm: Some("Registry".to_string())
            })
        );
        assert_eq!(parse_challenge("Negotiate"), None);
        assert_eq!(parse_challenge("Bearer service=\"x\""), None);
    }

    #[test]
    fn cache_drops_expired_sessions() {
        let mut cache = TokenCache::new();
        let key = TokenCache::key("https://auth", Some("svc"), "repository:a:pull");
        cache.insert(
            key.clone(),
            RegistrySession {
                host: "h".to_string(),
                token: "t".to_string(),
                expires_at: session_expiry(Some(300)),
                scope: "repository:a:pull".to_string(),
            },
        );
        assert_eq!(cache.get(&key).map(|s| s.token), Some("t".to_string()));

        // Lifetime shorter than the safety margin expires immediately
        cache.insert(
            key.clone(),
            RegistrySession {
                host: "h".to_string(),
                token: "t2".to_string(),
                expires_at: session_expiry(Some(10)),
                scope: "repository:a:pull".to_string(),
            },
        );
        assert!(cache.get(&key).is_none());
        assert!(cache.sessions.is_empty());
    }
}
