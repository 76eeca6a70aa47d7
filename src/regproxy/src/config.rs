use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

// Constants for hardcoded values
/// Default Docker registry name
pub const DEFAULT_REGISTRY_NAME: &str = "docker.io";

/// Default Docker registry URL
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Manifest Accept header sent upstream.
/// Lists and indexes come first so multi-arch references resolve to the index.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Default token expiry in seconds (5 minutes)
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Safety margin to subtract from token expiry (30 seconds)
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Default cache budget: 100 GiB
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Parsed default configuration (built once at first access)
static DEFAULT_CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub certs: CertsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Verbose logging (`DEBUG` env)
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Forward proxy port speaking `CONNECT` (Docker's `HTTPS_PROXY`)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: Option<u16>,
    /// Plain HTTP port, e.g. behind a TLS-terminating front end
    #[serde(default)]
    pub http_port: Option<u16>,
    /// HTTPS front; on unless `enabled = false`
    #[serde(default = "default_tls")]
    pub tls: Option<TlsConfig>,
    /// Directory of client-install scripts exposed under `/scripts/`
    #[serde(default)]
    pub scripts_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            proxy_port: default_proxy_port(),
            http_port: None,
            tls: default_tls(),
            scripts_dir: None,
        }
    }
}

fn default_tls() -> Option<TlsConfig> {
    Some(TlsConfig::default())
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> Option<u16> {
    Some(3128)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_https_port")]
    pub port: u16,
    /// Certificate and key files; when empty a leaf is issued by the proxy CA
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    /// Names the CA-issued front certificate covers
    #[serde(default = "default_front_hostnames")]
    pub hostnames: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_https_port(),
            cert_path: String::new(),
            key_path: String::new(),
            hostnames: default_front_hostnames(),
        }
    }
}

fn default_https_port() -> u16 {
    443
}

fn default_front_hostnames() -> Vec<String> {
    vec!["localhost".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: String,
    /// Byte budget; accepts `100g`-style strings in TOML and `CACHE_MAX_SIZE`
    #[serde(default = "default_cache_max_size", deserialize_with = "deserialize_byte_size")]
    pub max_size: u64,
    /// Seconds a tag-addressed manifest is served without revalidation
    #[serde(default = "default_manifest_ttl_secs")]
    pub manifest_ttl_secs: u64,
    /// How old a manifest may be when served stale because upstream is down
    #[serde(default = "default_stale_allowance_secs")]
    pub stale_allowance_secs: u64,
    /// Cache upstream 404s for manifests; disabled when unset
    #[serde(default)]
    pub negative_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            max_size: default_cache_max_size(),
            manifest_ttl_secs: default_manifest_ttl_secs(),
            stale_allowance_secs: default_stale_allowance_secs(),
            negative_ttl_secs: None,
        }
    }
}

fn default_cache_directory() -> String {
    "cache".to_string()
}

fn default_cache_max_size() -> u64 {
    DEFAULT_CACHE_MAX_SIZE
}

fn default_manifest_ttl_secs() -> u64 {
    60
}

fn default_stale_allowance_secs() -> u64 {
    7 * 24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertsConfig {
    #[serde(default = "default_certs_directory")]
    pub directory: String,
    #[serde(default = "default_ca_common_name")]
    pub ca_common_name: String,
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            directory: default_certs_directory(),
            ca_common_name: default_ca_common_name(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

fn default_certs_directory() -> String {
    "certs".to_string()
}

fn default_ca_common_name() -> String {
    "Registry Proxy CA".to_string()
}

fn default_leaf_validity_days() -> u32 {
    365
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub tls: Option<UpstreamTlsConfig>,
    /// Extra registries keyed by hostname, on top of the built-in ones
    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Abort a transfer when no data arrives for this long
    #[serde(default = "default_idle_read_timeout_secs")]
    pub idle_read_timeout_secs: u64,
    /// Prefer IPv4 addresses when resolving upstream hosts
    #[serde(default = "default_true")]
    pub prefer_ipv4: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            tls: None,
            registries: HashMap::new(),
            http_proxy: None,
            https_proxy: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_read_timeout_secs: default_idle_read_timeout_secs(),
            prefer_ipv4: true,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_read_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTlsConfig {
    #[serde(default)]
    pub ca_bundle_path: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URLs tried in order; defaults to `https://{hostname}`
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
    #[serde(default)]
    pub insecure: bool,
}

impl RegistryConfig {
    /// Mirrors to contact for `host`, never empty.
    pub fn mirrors_for(&self, host: &str) -> Vec<String> {
        if self.mirrors.is_empty() {
            vec![format!("https://{}", host)]
        } else {
            self.mirrors
                .iter()
                .map(|m| m.trim_end_matches('/').to_string())
                .collect()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl Config {
    /// Build the default configuration directly in Rust code
    fn build_default() -> Config {
        Config {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            certs: CertsConfig::default(),
            upstream: UpstreamConfig::default(),
            debug: false,
        }
    }

    pub(crate) fn default_parsed() -> &'static Config {
        DEFAULT_CONFIG.get_or_init(Self::build_default)
    }

    /// Load a TOML configuration file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Config> {
        toml::from_str(raw).map_err(|e| ProxyError::Config(format!("Invalid config: {}", e)))
    }

    /// Apply process environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `REGISTRIES`, `CACHE_MAX_SIZE`, `HTTP_PROXY`, `HTTPS_PROXY` and
    /// `DEBUG` using `lookup` as the environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .or_else(|| lookup(&key.to_lowercase()))
                .filter(|v| !v.trim().is_empty())
        };

        if let Some(registries) = get("REGISTRIES") {
            for host in registries.split_whitespace() {
                let host = host.trim_end_matches('/').to_lowercase();
                self.upstream.registries.entry(host).or_default();
            }
        }

        if let Some(size) = get("CACHE_MAX_SIZE") {
            self.cache.max_size = parse_byte_size(&size)?;
        }

        if let Some(proxy) = get("HTTP_PROXY") {
            self.upstream.http_proxy = Some(proxy);
        }
        if let Some(proxy) = get("HTTPS_PROXY") {
            self.upstream.https_proxy = Some(proxy);
        }

        if let Some(debug) = get("DEBUG") {
            self.debug = matches!(
                debug.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        Ok(())
    }

    pub fn registry_config(&self, host: &str) -> Option<&RegistryConfig> {
        self.upstream.registries.get(host)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_parsed().clone()
    }
}

/// Parse a byte size such as `100g`, `512MiB`, `1048576`.
/// Suffixes are binary multiples (`k` = 1024).
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let s = input.trim().to_lowercase();
    if s.is_empty() {
        return Err(ProxyError::Config("Empty size".to_string()));
    }

    let digits_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    let suffix = suffix.trim();
    let suffix = suffix
        .strip_suffix("ib")
        .or_else(|| suffix.strip_suffix('b'))
        .unwrap_or(suffix);

    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        "t" => 1024 * 1024 * 1024 * 1024,
        other => {
            return Err(ProxyError::Config(format!(
                "Unknown size suffix '{}' in '{}'",
                other, input
            )))
        }
    };

    let value: f64 = number
        .parse()
        .map_err(|_| ProxyError::Config(format!("Invalid size '{}'", input)))?;
    if value < 0.0 || !value.is_finite() {
        return Err(ProxyError::Config(format!("Invalid size '{}'", input)));
    }

    Ok((value * multiplier as f64) as u64)
}

fn deserialize_byte_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}
