//! Configuration defaults, TOML loading, byte sizes and environment overrides.

use regproxy::config::{parse_byte_size, Config, DEFAULT_CACHE_MAX_SIZE};
use std::collections::HashMap;
use tempfile::TempDir;

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.server.bind_address, "0.0.0.0");
    assert_eq!(config.server.proxy_port, Some(3128));
    assert_eq!(config.server.http_port, None);

    let tls = config.server.tls.as_ref().expect("HTTPS front on by default");
    assert!(tls.enabled);
    assert_eq!(tls.port, 443);
    assert!(tls.cert_path.is_empty());

    assert_eq!(config.cache.max_size, DEFAULT_CACHE_MAX_SIZE);
    assert_eq!(config.cache.manifest_ttl_secs, 60);
    assert_eq!(config.cache.negative_ttl_secs, None);
    assert_eq!(config.upstream.connect_timeout_secs, 10);
    assert!(config.upstream.prefer_ipv4);
    assert!(config.upstream.registries.is_empty());
    assert!(!config.debug);
}

#[test]
fn test_parse_byte_size() {
    assert_eq!(parse_byte_size("1048576").unwrap(), 1_048_576);
    assert_eq!(parse_byte_size("100g").unwrap(), 100 * 1024 * 1024 * 1024);
    assert_eq!(parse_byte_size("100G").unwrap(), 100 * 1024 * 1024 * 1024);
    assert_eq!(parse_byte_size("512MiB").unwrap(), 512 * 1024 * 1024);
    assert_eq!(parse_byte_size("64mb").unwrap(), 64 * 1024 * 1024);
    assert_eq!(parse_byte_size("1.5k").unwrap(), 1536);
    assert_eq!(parse_byte_size("2t").unwrap(), 2 * 1024u64.pow(4));
    assert_eq!(parse_byte_size(" 10 k ").unwrap(), 10 * 1024);

    assert!(parse_byte_size("").is_err());
    assert!(parse_byte_size("10x").is_err());
    assert!(parse_byte_size("gigabytes").is_err());
}

#[test]
fn test_toml_sections_and_sizes() {
    let config = Config::from_toml_str(
        r#"
debug = true

[server]
proxy_port = 8080
http_port = 5000

[server.tls]
enabled = false

[cache]
directory = "/var/cache/regproxy"
max_size = "20g"
negative_ttl_secs = 30

[upstream.registries."registry.internal:5000"]
mirrors = ["http://10.0.0.5:5000/", "http://10.0.0.6:5000"]
insecure = true

[upstream.registries."ghcr.io"]
auth = { username = "bot", password = "secret" }
"#,
    )
    .unwrap();

    assert!(config.debug);
    assert_eq!(config.server.proxy_port, Some(8080));
    assert_eq!(config.server.http_port, Some(5000));
    assert!(!config.server.tls.as_ref().unwrap().enabled);
    assert_eq!(config.cache.directory, "/var/cache/regproxy");
    assert_eq!(config.cache.max_size, 20 * 1024 * 1024 * 1024);
    assert_eq!(config.cache.negative_ttl_secs, Some(30));
    // Untouched fields keep their defaults
    assert_eq!(config.cache.manifest_ttl_secs, 60);
    assert_eq!(config.certs.directory, "certs");

    let internal = config.registry_config("registry.internal:5000").unwrap();
    assert!(internal.insecure);
    assert_eq!(
        internal.mirrors_for("registry.internal:5000"),
        vec!["http://10.0.0.5:5000", "http://10.0.0.6:5000"]
    );

    let ghcr = config.registry_config("ghcr.io").unwrap();
    assert_eq!(ghcr.auth.as_ref().unwrap().username, "bot");
    assert_eq!(ghcr.mirrors_for("ghcr.io"), vec!["https://ghcr.io"]);
}

#[test]
fn test_numeric_max_size_and_missing_tls_section() {
    let config = Config::from_toml_str("[cache]\nmax_size = 4096\n").unwrap();
    assert_eq!(config.cache.max_size, 4096);
    assert!(config.server.tls.as_ref().is_some_and(|tls| tls.enabled));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let err = Config::from_toml_str("[cache]\nmax_size = \"lots\"\n").unwrap_err();
    assert!(matches!(err, regproxy::ProxyError::Config(_)));
}

#[test]
fn test_from_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("regproxy.toml");
    std::fs::write(&path, "[certs]\ndirectory = \"/etc/regproxy/certs\"\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.certs.directory, "/etc/regproxy/certs");
    assert_eq!(config.certs.leaf_validity_days, 365);

    assert!(Config::from_file(&temp_dir.path().join("missing.toml")).is_err());
}

#[test]
fn test_environment_overrides() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("REGISTRIES", "harbor.example.com registry.internal:5000/"),
        ("cache_max_size", "512m"),
        ("HTTPS_PROXY", "http://corp-proxy:3128"),
        ("DEBUG", "true"),
    ]);

    let mut config = Config::default();
    config
        .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
        .unwrap();

    assert!(config.registry_config("harbor.example.com").is_some());
    assert!(config.registry_config("registry.internal:5000").is_some());
    assert_eq!(config.cache.max_size, 512 * 1024 * 1024);
    assert_eq!(config.upstream.https_proxy.as_deref(), Some("http://corp-proxy:3128"));
    assert_eq!(config.upstream.http_proxy, None);
    assert!(config.debug);
}

#[test]
fn test_environment_keeps_configured_registry() {
    let mut config = Config::from_toml_str(
        "[upstream.registries.\"harbor.example.com\"]\nmirrors = [\"https://mirror.example.com\"]\n",
    )
    .unwrap();
    config
        .apply_env_from(|key| (key == "REGISTRIES").then(|| "harbor.example.com".to_string()))
        .unwrap();

    let harbor = config.registry_config("harbor.example.com").unwrap();
    assert_eq!(harbor.mirrors, vec!["https://mirror.example.com"]);
}

#[test]
fn test_environment_rejects_bad_size() {
    let mut config = Config::default();
    let result = config.apply_env_from(|key| (key == "CACHE_MAX_SIZE").then(|| "huge".to_string()));
    assert!(result.is_err());

    let mut config = Config::default();
    config
        .apply_env_from(|key| (key == "DEBUG").then(|| "0".to_string()))
        .unwrap();
    assert!(!config.debug);
}
