pub mod cache;
pub mod certs;
pub mod config;
pub mod dns;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod state;
pub mod tls;

pub use cache::CacheStorage;
pub use certs::{CertificateAuthority, CertificateEntry};
pub use config::Config;
pub use error::{ProxyError, Result};
pub use server::{build_router, registry_router, start_server, ServerHandle};
pub use state::AppState;
