//! Maps an intercepted host + path (or a mirror-mode path) onto a registry
//! and the kind of registry API call being made.

use crate::cache::metadata::{is_digest, validate_repository, validate_tag};
use crate::config::{Config, RegistryConfig, DEFAULT_REGISTRY_NAME, DEFAULT_REGISTRY_URL};
use std::collections::HashMap;
use std::fmt;

/// Registries the proxy knows how to cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistryId {
    DockerHub,
    Ghcr,
    Mcr,
    /// `gcr.io` or a regional `*.gcr.io` host
    Gcr(String),
    Quay,
    Custom(String),
}

impl RegistryId {
    /// Resolve a well-known registry host.
    pub fn known(host: &str) -> Option<RegistryId> {
        match host {
            "docker.io" | "registry-1.docker.io" | "index.docker.io" => Some(RegistryId::DockerHub),
            "ghcr.io" => Some(RegistryId::Ghcr),
            "mcr.microsoft.com" => Some(RegistryId::Mcr),
            "quay.io" => Some(RegistryId::Quay),
            h if h == "gcr.io" || h.ends_with(".gcr.io") => Some(RegistryId::Gcr(h.to_string())),
            _ => None,
        }
    }

    /// Canonical name, used as cache namespace and configuration key.
    pub fn name(&self) -> &str {
        match self {
            RegistryId::DockerHub => DEFAULT_REGISTRY_NAME,
            RegistryId::Ghcr => "ghcr.io",
            RegistryId::Mcr => "mcr.microsoft.com",
            RegistryId::Gcr(host) => host,
            RegistryId::Quay => "quay.io",
            RegistryId::Custom(host) => host,
        }
    }

    pub fn default_upstream(&self) -> String {
        match self {
            RegistryId::DockerHub => DEFAULT_REGISTRY_URL.to_string(),
            other => format!("https://{}", other.name()),
        }
    }

    /// Docker Hub official images live under `library/`.
    pub fn normalize_repository(&self, repository: &str) -> String {
        if *self == RegistryId::DockerHub && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        }
    }
}

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// `GET /v2/`
    ApiVersion,
    Manifest { repository: String, reference: String },
    Blob { repository: String, digest: String },
    /// Registry auth endpoints; never cached
    Token,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub registry: Option<RegistryId>,
    pub upstream_base_url: Option<String>,
    pub kind: RouteKind,
    pub cacheable: bool,
}

impl RouteDecision {
    /// Unknown host: forward untouched.
    pub fn passthrough() -> Self {
        Self {
            registry: None,
            upstream_base_url: None,
            kind: RouteKind::Other,
            cacheable: false,
        }
    }

    fn for_registry(registry: RegistryId, upstream: String, kind: RouteKind) -> Self {
        let cacheable = matches!(kind, RouteKind::Manifest { .. } | RouteKind::Blob { .. });
        Self {
            registry: Some(registry),
            upstream_base_url: Some(upstream),
            kind,
            cacheable,
        }
    }
}

/// Token endpoints that are tunneled rather than intercepted.
const TOKEN_HOSTS: &[&str] = &["auth.docker.io"];

pub struct RequestRouter {
    /// Configured registries keyed by canonical name
    registries: HashMap<String, RegistryConfig>,
}

impl RequestRouter {
    pub fn new(config: &Config) -> Self {
        let registries = config
            .upstream
            .registries
            .iter()
            .map(|(host, registry)| {
                let host = normalize_host(host);
                let name = RegistryId::known(&host)
                    .map(|id| id.name().to_string())
                    .unwrap_or(host);
                (name, registry.clone())
            })
            .collect();
        Self { registries }
    }

    /// Registry for `host`, if the proxy handles it.
    pub fn registry_for_host(&self, host: &str) -> Option<RegistryId> {
        let host = normalize_host(host);
        RegistryId::known(&host).or_else(|| {
            self.registries
                .contains_key(&host)
                .then(|| RegistryId::Custom(host))
        })
    }

    pub fn registry_config(&self, registry: &RegistryId) -> Option<&RegistryConfig> {
        self.registries.get(registry.name())
    }

    /// Upstream base URLs in failover order.
    pub fn mirrors(&self, registry: &RegistryId) -> Vec<String> {
        match self.registry_config(registry) {
            Some(config) if !config.mirrors.is_empty() => config.mirrors_for(registry.name()),
            _ => vec![registry.default_upstream()],
        }
    }

    /// Every registry the proxy intercepts, for status output.
    pub fn configured_registries(&self) -> Vec<String> {
        let mut names: Vec<String> = ["docker.io", "ghcr.io", "mcr.microsoft.com", "gcr.io", "quay.io"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for name in self.registries.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Whether a `CONNECT` to `host` should be TLS-intercepted.
    pub fn should_intercept(&self, host: &str) -> bool {
        let host = normalize_host(host);
        !TOKEN_HOSTS.contains(&host.as_str()) && self.registry_for_host(&host).is_some()
    }

    /// Classify a request made to `host` (intercepted mode).
    pub fn classify(&self, host: &str, path: &str) -> RouteDecision {
        let host = normalize_host(host);
        if TOKEN_HOSTS.contains(&host.as_str()) {
            return RouteDecision::for_registry(
                RegistryId::DockerHub,
                format!("https://{}", host),
                RouteKind::Token,
            );
        }
        let Some(registry) = self.registry_for_host(&host) else {
            return RouteDecision::passthrough();
        };

        // The API host the client talked to stays the upstream unless mirrors
        // are configured for the registry.
        let upstream = self
            .mirrors(&registry)
            .into_iter()
            .next()
            .unwrap_or_else(|| registry.default_upstream());
        let kind = classify_path(path, |name| Some(registry.normalize_repository(name)));
        RouteDecision::for_registry(registry, upstream, kind)
    }

    /// Classify a request addressed to the proxy itself as a registry mirror.
    ///
    /// `ns` is the query parameter Docker adds for mirror requests. Without
    /// it, a hostname-like first path component selects the registry
    /// (`/v2/ghcr.io/org/app/...`), else Docker Hub. A host the proxy does
    /// not serve yields no registry.
    pub fn classify_mirror(&self, path: &str, ns: Option<&str>) -> RouteDecision {
        let mut registry = match ns.map(normalize_host).filter(|h| !h.is_empty()) {
            Some(host) => match self.registry_for_host(&host) {
                Some(id) => Some(id),
                None => return unknown_mirror_host(&host),
            },
            None => None,
        };

        let mut unknown_host = None;
        let kind = classify_path(path, |name| {
            if let Some(registry) = &registry {
                return Some(registry.normalize_repository(name));
            }
            let (host, repository) = parse_repository(name);
            let Some(id) = self.registry_for_host(&host) else {
                unknown_host = Some(host);
                return None;
            };
            let repository = id.normalize_repository(&repository);
            registry = Some(id);
            Some(repository)
        });
        if let Some(host) = unknown_host {
            return unknown_mirror_host(&host);
        }

        let registry = match registry {
            Some(id) => id,
            None => match host_prefix(path) {
                Some(host) => match self.registry_for_host(&host) {
                    Some(id) => id,
                    None => return unknown_mirror_host(&host),
                },
                None => RegistryId::DockerHub,
            },
        };
        let upstream = self
            .mirrors(&registry)
            .into_iter()
            .next()
            .unwrap_or_else(|| registry.default_upstream());
        RouteDecision::for_registry(registry, upstream, kind)
    }
}

fn unknown_mirror_host(host: &str) -> RouteDecision {
    tracing::debug!(host = %host, "Mirror request names a registry the proxy does not serve");
    RouteDecision::passthrough()
}

/// Hostname-like first component of a mirror-mode path
/// (`/v2/ghcr.io/org/app/tags/list`).
fn host_prefix(path: &str) -> Option<String> {
    let first = path.strip_prefix("/v2/")?.split('/').next()?;
    looks_like_host(first).then(|| normalize_host(first))
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    host.strip_suffix(":443").map(str::to_string).unwrap_or(host)
}

/// Parse a `/v2/...` path. `resolve` maps the raw `<name>` to a repository.
fn classify_path<F>(path: &str, mut resolve: F) -> RouteKind
where
    F: FnMut(&str) -> Option<String>,
{
    let path = path.split('?').next().unwrap_or(path);

    if path == "/v2" || path == "/v2/" {
        return RouteKind::ApiVersion;
    }
    if path == "/token" || path == "/v2/token" {
        return RouteKind::Token;
    }
    let Some(rest) = path.strip_prefix("/v2/") else {
        return RouteKind::Other;
    };

    if let Some((name, reference)) = rest.rsplit_once("/manifests/") {
        if reference.is_empty() || reference.contains('/') {
            return RouteKind::Other;
        }
        if !is_digest(reference) && validate_tag(reference).is_err() {
            return RouteKind::Other;
        }
        return match resolve(name) {
            Some(repository) if validate_repository(&repository).is_ok() => RouteKind::Manifest {
                repository,
                reference: reference.to_string(),
            },
            _ => RouteKind::Other,
        };
    }

    if let Some((name, digest)) = rest.rsplit_once("/blobs/") {
        // Uploads are push traffic
        if digest.is_empty() || digest.contains('/') || name.ends_with("/blobs") {
            return RouteKind::Other;
        }
        return match resolve(name) {
            Some(repository) if validate_repository(&repository).is_ok() => RouteKind::Blob {
                repository,
                digest: digest.to_string(),
            },
            _ => RouteKind::Other,
        };
    }

    RouteKind::Other
}

/// Split a mirror-mode name into registry host and repository.
///
/// `nginx` → Docker Hub `library/nginx`; `user/app` → Docker Hub;
/// `quay.io/org/app` → `quay.io`, `org/app`.
pub fn parse_repository(name: &str) -> (String, String) {
    let result = match name.split_once('/') {
        Some((first, rest)) if looks_like_host(first) => (normalize_host(first), rest.to_string()),
        Some(_) => (DEFAULT_REGISTRY_NAME.to_string(), name.to_string()),
        None => (DEFAULT_REGISTRY_NAME.to_string(), format!("library/{}", name)),
    };
    tracing::debug!(
        name = %name,
        registry = %result.0,
        repository = %result.1,
        "Parsed repository name"
    );
    result
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> RequestRouter {
        let mut config = Config::default();
        config
            .upstream
            .registries
            .insert("registry.internal:5000".to_string(), RegistryConfig::default());
        RequestRouter::new(&config)
    }

    #[test]
    fn known_hosts_are_intercepted() {
        let router = router();
        assert!(router.should_intercept("registry-1.docker.io"));
        assert!(router.should_intercept("ghcr.io:443"));
        assert!(router.should_intercept("eu.gcr.io"));
        assert!(router.should_intercept("registry.internal:5000"));
        assert!(!router.should_intercept("auth.docker.io"));
        assert!(!router.should_intercept("example.com"));
    }

    #[test]
    fn classify_manifest_and_blob() {
        let router = router();
        let digest = format!("sha256:{}", "b".repeat(64));

        let decision = router.classify("registry-1.docker.io", "/v2/library/nginx/manifests/latest");
        assert_eq!(decision.registry, Some(RegistryId::DockerHub));
        assert_eq!(decision.upstream_base_url.as_deref(), Some(DEFAULT_REGISTRY_URL));
        assert!(decision.cacheable);
        assert_eq!(
            decision.kind,
            RouteKind::Manifest {
                repository: "library/nginx".to_string(),
                reference: "latest".to_string()
            }
        );

        let decision = router.classify("ghcr.io", &format!("/v2/org/app/blobs/{}", digest));
        assert_eq!(decision.registry, Some(RegistryId::Ghcr));
        assert_eq!(
            decision.kind,
            RouteKind::Blob {
                repository: "org/app".to_string(),
                digest
            }
        );
    }

    #[test]
    fn classify_uncached_paths() {
        let router = router();
        assert_eq!(router.classify("quay.io", "/v2/").kind, RouteKind::ApiVersion);
        assert_eq!(router.classify("ghcr.io", "/token").kind, RouteKind::Token);
        assert!(!router.classify("ghcr.io", "/token").cacheable);
        assert_eq!(
            router.classify("quay.io", "/v2/org/app/blobs/uploads/").kind,
            RouteKind::Other
        );
        assert_eq!(router.classify("quay.io", "/v2/org/app/tags/list").kind, RouteKind::Other);
        assert_eq!(router.classify("example.com", "/v2/"), RouteDecision::passthrough());
    }

    #[test]
    fn mirror_mode_selects_registry() {
        let router = router();

        let decision = router.classify_mirror("/v2/alpine/manifests/3.20", None);
        assert_eq!(decision.registry, Some(RegistryId::DockerHub));
        assert!(matches!(decision.kind, RouteKind::Manifest { ref repository, .. } if repository == "library/alpine"));

        let decision = router.classify_mirror("/v2/ghcr.io/org/app/manifests/v1", None);
        assert_eq!(decision.registry, Some(RegistryId::Ghcr));
        assert!(matches!(decision.kind, RouteKind::Manifest { ref repository, .. } if repository == "org/app"));

        let decision = router.classify_mirror("/v2/org/app/manifests/v1", Some("quay.io"));
        assert_eq!(decision.registry, Some(RegistryId::Quay));
        assert_eq!(decision.upstream_base_url.as_deref(), Some("https://quay.io"));

        let decision = router.classify_mirror("/v2/ghcr.io/org/app/tags/list", None);
        assert_eq!(decision.registry, Some(RegistryId::Ghcr));
        assert_eq!(decision.kind, RouteKind::Other);
    }

    #[test]
    fn mirror_mode_rejects_unserved_hosts() {
        let router = router();

        let decision = router.classify_mirror("/v2/org/app/manifests/v1", Some("evil.example.com"));
        assert_eq!(decision, RouteDecision::passthrough());
        assert!(!decision.cacheable);

        let digest = format!("sha256:{}", "c".repeat(64));
        let decision =
            router.classify_mirror(&format!("/v2/evil.example.com/org/app/blobs/{}", digest), None);
        assert_eq!(decision.registry, None);
        assert!(!decision.cacheable);

        let decision = router.classify_mirror("/v2/evil.example.com/org/app/tags/list", None);
        assert_eq!(decision.registry, None);

        // Configured private registries are still served
        let decision = router.classify_mirror("/v2/org/app/manifests/v1", Some("registry.internal:5000"));
        assert_eq!(
            decision.registry,
            Some(RegistryId::Custom("registry.internal:5000".to_string()))
        );
        assert!(decision.cacheable);
    }

    #[test]
    fn parse_repository_defaults_to_docker_hub() {
        assert_eq!(
            parse_repository("nginx"),
            ("docker.io".to_string(), "library/nginx".to_string())
        );
        assert_eq!(
            parse_repository("zyclonite/zerotier"),
            ("docker.io".to_string(), "zyclonite/zerotier".to_string())
        );
        assert_eq!(
            parse_repository("quay.io/cilium/cilium"),
            ("quay.io".to_string(), "cilium/cilium".to_string())
        );
    }
}
