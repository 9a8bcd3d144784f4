//! fairway-proxy binary entry point

use fairway_proxy::{ProxyConfig, ProxyServer};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("FAIRWAY_CONFIG").ok().map(PathBuf::from);
    let config = match ProxyConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal: configuration invalid");
            std::process::exit(1);
        }
    };

    let server = match ProxyServer::builder().config(config).build() {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "fatal: server initialization failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "server terminated with error");
        std::process::exit(1);
    }
}
