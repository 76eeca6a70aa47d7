//! Proxy certificate authority.
//!
//! The root is loaded from `<dir>/ca.crt` + `<dir>/ca.key` or generated on
//! first use. Leaf certificates are issued per intercepted hostname, kept in
//! memory and persisted under `<dir>/hosts/` so restarts reuse them.

use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_LOCK_FILE: &str = "ca.lock";
const HOSTS_DIR: &str = "hosts";

/// Root CA validity (10 years)
const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Leaves with less than this left are reissued
const LEAF_RENEWAL_DAYS: i64 = 30;

/// Backdate `not_before` to tolerate client clock skew
const CLOCK_SKEW: Duration = Duration::from_secs(60 * 60);

/// Leaf certificate issued for one intercepted hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
    /// SHA-256 of the issuing root's PEM; leaves from another root are discarded
    pub issuer_fingerprint: String,
}

impl CertificateEntry {
    pub fn needs_renewal(&self) -> bool {
        needs_renewal(self.expires_at, LEAF_RENEWAL_DAYS)
    }
}

struct RootAuthority {
    cert_pem: String,
    key: KeyPair,
    issuer: rcgen::Certificate,
    fingerprint: String,
}

pub struct CertificateAuthority {
    dir: PathBuf,
    common_name: String,
    leaf_validity_days: u32,
    root: OnceCell<Arc<RootAuthority>>,
    leaves: Mutex<HashMap<String, Arc<CertificateEntry>>>,
    leases: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    issued: AtomicU64,
}

impl CertificateAuthority {
    /// Leaf validity is raised to twice the renewal window so a fresh leaf
    /// is never already due for renewal.
    pub fn new(dir: impl Into<PathBuf>, common_name: impl Into<String>, leaf_validity_days: u32) -> Self {
        Self {
            dir: dir.into(),
            common_name: common_name.into(),
            leaf_validity_days: leaf_validity_days.max(2 * LEAF_RENEWAL_DAYS as u32),
            root: OnceCell::new(),
            leaves: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    async fn root(&self) -> Result<Arc<RootAuthority>> {
        self.root
            .get_or_try_init(|| async {
                let dir = self.dir.clone();
                let cn = self.common_name.clone();
                tokio::task::spawn_blocking(move || load_or_generate_root(&dir, &cn))
                    .await
                    .map_err(|e| ProxyError::KeyMaterial(format!("CA init task failed: {}", e)))?
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Load or generate the root now. Startup calls this so broken key
    /// material fails fast instead of on the first intercepted connection.
    pub async fn initialize(&self) -> Result<()> {
        self.root().await.map(|_| ())
    }

    /// PEM of the root certificate, for clients to trust.
    pub async fn ca_certificate_pem(&self) -> Result<String> {
        Ok(self.root().await?.cert_pem.clone())
    }

    /// Number of leaf certificates issued by this process.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Return a valid leaf for `hostname`, issuing one if needed.
    pub async fn ensure_certificate(&self, hostname: &str) -> Result<Arc<CertificateEntry>> {
        let hostname = normalize_hostname(hostname)?;

        if let Some(entry) = self.cached_leaf(&hostname) {
            return Ok(entry);
        }

        let root = self.root().await?;

        // One issuance per hostname at a time
        let lease = {
            let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
            leases
                .entry(hostname.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lease.lock().await;

        if let Some(entry) = self.cached_leaf(&hostname) {
            return Ok(entry);
        }

        let path = self.leaf_path(&hostname);
        if let Some(entry) = load_leaf(&path, &root.fingerprint).await {
            tracing::debug!(host = %hostname, "Loaded leaf certificate from disk");
            let entry = Arc::new(entry);
            self.remember_leaf(&hostname, entry.clone());
            return Ok(entry);
        }

        let validity_days = self.leaf_validity_days;
        let issue_root = root.clone();
        let issue_host = hostname.clone();
        let entry = tokio::task::spawn_blocking(move || {
            issue_leaf(&issue_root, &issue_host, validity_days)
        })
        .await
        .map_err(|e| ProxyError::Tls(format!("Certificate task failed: {}", e)))??;

        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(host = %hostname, expires_at = %entry.expires_at, "Issued leaf certificate");

        if let Err(e) = persist_leaf(&path, &entry).await {
            // Memory copy is still valid; next restart reissues
            tracing::warn!(host = %hostname, error = %e, "Failed to persist leaf certificate");
        }

        let entry = Arc::new(entry);
        self.remember_leaf(&hostname, entry.clone());
        Ok(entry)
    }

    /// Issue an unpersisted certificate for the HTTPS front covering all of
    /// `hostnames` (DNS names or IP literals).
    pub async fn issue_server_certificate(&self, hostnames: &[String]) -> Result<CertificateEntry> {
        let names = hostnames
            .iter()
            .map(|h| normalize_hostname(h))
            .collect::<Result<Vec<_>>>()?;
        let root = self.root().await?;
        let validity_days = self.leaf_validity_days;
        let entry = tokio::task::spawn_blocking(move || issue_for_names(&root, &names, validity_days))
            .await
            .map_err(|e| ProxyError::Tls(format!("Certificate task failed: {}", e)))??;
        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(hosts = ?hostnames, "Issued front certificate");
        Ok(entry)
    }

    fn cached_leaf(&self, hostname: &str) -> Option<Arc<CertificateEntry>> {
        let leaves = self.leaves.lock().unwrap_or_else(|e| e.into_inner());
        leaves
            .get(hostname)
            .filter(|entry| !entry.needs_renewal())
            .cloned()
    }

    fn remember_leaf(&self, hostname: &str, entry: Arc<CertificateEntry>) {
        let mut leaves = self.leaves.lock().unwrap_or_else(|e| e.into_inner());
        leaves.insert(hostname.to_string(), entry);
    }

    fn leaf_path(&self, hostname: &str) -> PathBuf {
        self.dir
            .join(HOSTS_DIR)
            .join(format!("{}.json", hostname.replace(':', "_")))
    }
}

/// Lowercase, strip a trailing dot and reject anything that could escape the
/// hosts directory.
fn normalize_hostname(hostname: &str) -> Result<String> {
    let host = hostname
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let valid = !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'));
    if !valid {
        return Err(ProxyError::Tls(format!("Invalid hostname '{}'", hostname)));
    }
    Ok(host)
}

fn needs_renewal(expiry: DateTime<Utc>, threshold_days: i64) -> bool {
    (expiry - Utc::now()).num_days() < threshold_days
}

fn fingerprint(pem: &str) -> String {
    hex::encode(Sha256::digest(pem.as_bytes()))
}

fn to_datetime(time: SystemTime) -> Result<DateTime<Utc>> {
    let secs = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| ProxyError::Tls(format!("Failed to calculate expiry: {}", e)))?
        .as_secs();
    DateTime::from_timestamp(secs as i64, 0)
        .ok_or_else(|| ProxyError::Tls("Invalid expiry timestamp".to_string()))
}

fn load_or_generate_root(dir: &Path, common_name: &str) -> Result<RootAuthority> {
    fs::create_dir_all(dir).map_err(|e| {
        ProxyError::KeyMaterial(format!("Failed to create {}: {}", dir.display(), e))
    })?;

    let lock_path = dir.join(CA_LOCK_FILE);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to open CA lock: {}", e)))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to lock CA directory: {}", e)))?;

    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    let root = match (cert_path.exists(), key_path.exists()) {
        (true, true) => {
            let cert_pem = fs::read_to_string(&cert_path).map_err(|e| {
                ProxyError::KeyMaterial(format!("Failed to read {}: {}", cert_path.display(), e))
            })?;
            let key_pem = fs::read_to_string(&key_path).map_err(|e| {
                ProxyError::KeyMaterial(format!("Failed to read {}: {}", key_path.display(), e))
            })?;
            let root = parse_root(cert_pem, &key_pem)?;
            tracing::info!(path = %cert_path.display(), "Loaded CA certificate");
            root
        }
        (false, false) => {
            tracing::info!(path = %cert_path.display(), "Generating new CA certificate");
            let (cert_pem, key_pem) = generate_root(common_name)?;
            write_private(&key_path, key_pem.as_bytes())?;
            write_private(&cert_path, cert_pem.as_bytes())?;
            parse_root(cert_pem, &key_pem)?
        }
        (true, false) => {
            return Err(ProxyError::KeyMaterial(format!(
                "{} exists but {} is missing",
                cert_path.display(),
                key_path.display()
            )))
        }
        (false, true) => {
            return Err(ProxyError::KeyMaterial(format!(
                "{} exists but {} is missing",
                key_path.display(),
                cert_path.display()
            )))
        }
    };

    if let Err(e) = FileExt::unlock(&lock_file) {
        tracing::debug!(path = %lock_path.display(), error = %e, "Failed to release CA lock");
    }
    Ok(root)
}

fn generate_root(common_name: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to create CA params: {}", e)))?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = SystemTime::now();
    params.not_before = (now - CLOCK_SKEW).into();
    params.not_after = (now + CA_VALIDITY).into();

    let key = KeyPair::generate()
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to generate CA key pair: {}", e)))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to generate CA certificate: {}", e)))?;

    Ok((cert.pem(), key.serialize_pem()))
}

fn parse_root(cert_pem: String, key_pem: &str) -> Result<RootAuthority> {
    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to parse CA key: {}", e)))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| ProxyError::KeyMaterial(format!("Failed to parse CA certificate: {}", e)))?;
    // Re-signing yields an issuer with the persisted subject and key
    let issuer = params
        .self_signed(&key)
        .map_err(|e| ProxyError::KeyMaterial(format!("CA key does not match certificate: {}", e)))?;

    Ok(RootAuthority {
        fingerprint: fingerprint(&cert_pem),
        cert_pem,
        key,
        issuer,
    })
}

fn issue_leaf(root: &RootAuthority, hostname: &str, validity_days: u32) -> Result<CertificateEntry> {
    issue_for_names(root, &[hostname.to_string()], validity_days)
}

/// Sign a leaf covering every name in `names`; the first one is the CN.
fn issue_for_names(root: &RootAuthority, names: &[String], validity_days: u32) -> Result<CertificateEntry> {
    let primary = names
        .first()
        .ok_or_else(|| ProxyError::Tls("No hostnames for certificate".to_string()))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| ProxyError::Tls(format!("Failed to create leaf params: {}", e)))?;
    for name in names {
        let san = match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(name.clone().try_into().map_err(|e| {
                ProxyError::Tls(format!("Invalid DNS name {}: {}", name, e))
            })?),
        };
        params.subject_alt_names.push(san);
    }
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, primary.as_str());
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = SystemTime::now();
    let not_after = now + Duration::from_secs(u64::from(validity_days) * 24 * 60 * 60);
    params.not_before = (now - CLOCK_SKEW).into();
    params.not_after = not_after.into();

    let key = KeyPair::generate()
        .map_err(|e| ProxyError::Tls(format!("Failed to generate leaf key pair: {}", e)))?;
    let cert = params
        .signed_by(&key, &root.issuer, &root.key)
        .map_err(|e| ProxyError::Tls(format!("Failed to sign leaf certificate: {}", e)))?;

    Ok(CertificateEntry {
        hostname: primary.clone(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        expires_at: to_datetime(not_after)?,
        issuer_fingerprint: root.fingerprint.clone(),
    })
}

async fn load_leaf(path: &Path, root_fingerprint: &str) -> Option<CertificateEntry> {
    let raw = tokio::fs::read(path).await.ok()?;
    let entry: CertificateEntry = match serde_json::from_slice(&raw) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable leaf certificate");
            return None;
        }
    };
    if entry.issuer_fingerprint != root_fingerprint || entry.needs_renewal() {
        return None;
    }
    Some(entry)
}

async fn persist_leaf(path: &Path, entry: &CertificateEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(entry)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    restrict_permissions(&tmp)?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|e| {
        ProxyError::KeyMaterial(format!("Failed to write {}: {}", path.display(), e))
    })?;
    restrict_permissions(&tmp)?;
    fs::rename(&tmp, path).map_err(|e| {
        ProxyError::KeyMaterial(format!("Failed to write {}: {}", path.display(), e))
    })?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
