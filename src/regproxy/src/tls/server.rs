use crate::certs::CertificateEntry;
use crate::config::TlsConfig;
use crate::error::{ProxyError, Result};
use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::{ring::default_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

/// Install the ring provider (rustls 0.23+ requirement). Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

fn read_chain(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>> {
    let chain: Vec<CertificateDer<'static>> = certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificates: {}", e)))?;
    if chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found".to_string()));
    }
    Ok(chain)
}

fn read_key(reader: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>> {
    private_key(reader)
        .map_err(|e| ProxyError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("No private keys found".to_string()))
}

fn build_server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
    install_crypto_provider();
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ProxyError::Tls(format!("Failed to build TLS config: {}", e)))?;
    // Registry traffic is served by the HTTP/1.1 connection handler
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Server config from PEM strings (CA-issued leaves).
pub fn server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<Arc<rustls::ServerConfig>> {
    let chain = read_chain(&mut Cursor::new(cert_pem.as_bytes()))?;
    let key = read_key(&mut Cursor::new(key_pem.as_bytes()))?;
    build_server_config(chain, key)
}

/// axum-server config for a CA-issued certificate.
pub fn rustls_config_for_entry(entry: &CertificateEntry) -> Result<RustlsConfig> {
    let config = server_config_from_pem(&entry.cert_pem, &entry.key_pem)?;
    Ok(RustlsConfig::from_config(config))
}

/// axum-server config from the certificate and key files named in `tls`.
pub fn rustls_config_from_files(tls_config: &TlsConfig) -> Result<RustlsConfig> {
    let cert_path = Path::new(&tls_config.cert_path);
    let key_path = Path::new(&tls_config.key_path);

    if !cert_path.exists() {
        return Err(ProxyError::Tls(format!(
            "Certificate file not found: {}",
            cert_path.display()
        )));
    }
    if !key_path.exists() {
        return Err(ProxyError::Tls(format!(
            "Key file not found: {}",
            key_path.display()
        )));
    }

    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ProxyError::Tls(format!("Failed to open cert file: {}", e)))?;
    let chain = read_chain(&mut BufReader::new(cert_file))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ProxyError::Tls(format!("Failed to open key file: {}", e)))?;
    let key = read_key(&mut BufReader::new(key_file))?;

    Ok(RustlsConfig::from_config(build_server_config(chain, key)?))
}
