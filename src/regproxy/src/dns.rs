//! IPv4-preferring name resolution for upstream registries and tunnels.
//!
//! Registry hosts such as registry-1.docker.io publish AAAA records; on hosts
//! without a working IPv6 route the first connect attempt hangs until the
//! connect timeout. Both the reqwest client and raw CONNECT tunnels resolve
//! through here so IPv4 addresses are tried first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

fn box_err(e: impl std::error::Error + Send + Sync + 'static) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

/// Order addresses IPv4 first. Returns every address so IPv6-only hosts
/// still resolve.
pub fn prefer_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let (mut v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.into_iter().partition(|a| a.is_ipv4());
    v4.extend(v6);
    v4
}

/// Resolve `host:port` for a tunnel, IPv4 addresses first.
pub async fn resolve_host(host: &str, port: u16, ipv4_first: bool) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", host),
        ));
    }
    Ok(if ipv4_first { prefer_ipv4(addrs) } else { addrs })
}

/// Resolver for `reqwest::ClientBuilder::dns_resolver`.
#[derive(Debug, Default, Clone)]
pub struct Ipv4PreferResolver;

impl Resolve for Ipv4PreferResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolve_host(&host, 0, true).await.map_err(box_err)?;
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

pub fn ipv4_prefer_resolver() -> Arc<Ipv4PreferResolver> {
    Arc::new(Ipv4PreferResolver)
}
