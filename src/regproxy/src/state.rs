use crate::cache::{CacheStorage, ManifestStore, SingleFlight};
use crate::certs::CertificateAuthority;
use crate::config::Config;
use crate::error::Result;
use crate::registry::manifest::ResolvedManifest;
use crate::registry::route::{RegistryId, RequestRouter};
use crate::registry::upstream::{UpstreamClient, UpstreamTarget};
use axum::extract::FromRef;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-wide counters reported by `/status`.
#[derive(Default)]
pub struct ProxyStats {
    pub manifest_hits: AtomicU64,
    pub manifest_misses: AtomicU64,
    pub manifest_revalidated: AtomicU64,
    pub manifest_stale: AtomicU64,
    pub connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub intercepted: AtomicU64,
    pub tunneled: AtomicU64,
    pub upstream_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatsSnapshot {
    pub manifest_hits: u64,
    pub manifest_misses: u64,
    pub manifest_revalidated: u64,
    pub manifest_stale: u64,
    pub connections: u64,
    pub active_connections: u64,
    pub intercepted: u64,
    pub tunneled: u64,
    pub upstream_errors: u64,
}

impl ProxyStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ProxyStatsSnapshot {
            manifest_hits: load(&self.manifest_hits),
            manifest_misses: load(&self.manifest_misses),
            manifest_revalidated: load(&self.manifest_revalidated),
            manifest_stale: load(&self.manifest_stale),
            connections: load(&self.connections),
            active_connections: load(&self.active_connections),
            intercepted: load(&self.intercepted),
            tunneled: load(&self.tunneled),
            upstream_errors: load(&self.upstream_errors),
        }
    }
}

/// Decrements the active connection gauge when the connection task ends.
pub struct ConnectionGuard {
    stats: Arc<ProxyStats>,
}

impl ConnectionGuard {
    pub fn new(stats: Arc<ProxyStats>) -> Self {
        ProxyStats::incr(&stats.connections);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheStorage>,
    pub manifests: Arc<ManifestStore>,
    pub manifest_flight: Arc<SingleFlight<ResolvedManifest>>,
    pub router: Arc<RequestRouter>,
    pub upstream: Arc<UpstreamClient>,
    pub ca: Arc<CertificateAuthority>,
    pub stats: Arc<ProxyStats>,
    pub started_at: Instant,
}

impl AppState {
    /// Open the cache and build clients from `config`. The CA root is loaded
    /// here so unusable key material fails startup.
    pub async fn new(config: Config) -> Result<Self> {
        let cache_dir = PathBuf::from(&config.cache.directory);
        let cache = CacheStorage::open(&cache_dir, config.cache.max_size).await?;
        let manifests = ManifestStore::open(&cache_dir).await?;

        let ca = CertificateAuthority::new(
            &config.certs.directory,
            config.certs.ca_common_name.clone(),
            config.certs.leaf_validity_days,
        );
        ca.initialize().await?;

        let upstream = UpstreamClient::new(&config.upstream)?;
        let router = RequestRouter::new(&config);

        Ok(Self {
            config: Arc::new(config),
            cache,
            manifests: Arc::new(manifests),
            manifest_flight: Arc::new(SingleFlight::new()),
            router: Arc::new(router),
            upstream: Arc::new(upstream),
            ca: Arc::new(ca),
            stats: Arc::new(ProxyStats::default()),
            started_at: Instant::now(),
        })
    }

    pub fn upstream_target(&self, registry: &RegistryId) -> UpstreamTarget {
        let config = self.router.registry_config(registry);
        UpstreamTarget {
            registry: registry.clone(),
            mirrors: self.router.mirrors(registry),
            auth: config.and_then(|c| c.auth.clone()),
            insecure: config.is_some_and(|c| c.insecure),
        }
    }
}

impl FromRef<AppState> for Arc<CacheStorage> {
    fn from_ref(state: &AppState) -> Self {
        state.cache.clone()
    }
}
