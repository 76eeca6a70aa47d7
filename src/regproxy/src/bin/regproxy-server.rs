use clap::Parser;
use regproxy::{start_server, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "regproxy-server", version, about = "Caching proxy for container registries")]
struct Args {
    /// TOML configuration file; compiled-in defaults when omitted
    #[arg(short, long, env = "REGPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Blob and manifest cache directory
    #[arg(long)]
    cache_dir: Option<String>,

    /// CA and issued certificate directory
    #[arg(long)]
    certs_dir: Option<String>,

    /// Forward proxy port
    #[arg(long)]
    proxy_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(dir) = args.cache_dir {
        config.cache.directory = dir;
    }
    if let Some(dir) = args.certs_dir {
        config.certs.directory = dir;
    }
    if let Some(port) = args.proxy_port {
        config.server.proxy_port = Some(port);
    }

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(
        config = ?args.config,
        bind = %config.server.bind_address,
        proxy_port = ?config.server.proxy_port,
        "Starting regproxy"
    );

    let handle = start_server(config).await?;
    if let Some(addr) = handle.proxy_addr {
        tracing::info!("Set HTTPS_PROXY=http://{} and trust http://{}/ca.crt", addr, addr);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
        _ = handle.wait() => {
            tracing::error!("Listener stopped unexpectedly");
        }
    }
    Ok(())
}
