//! Tunnel broker binary
//!
//! Runs two listeners side by side:
//! - the tunnel port, where agents connect and receive a public endpoint
//! - the ingress port, where public HTTP requests are relayed to agents

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunnel_broker::server::{run_ingress_server, run_tunnel_server};
use tunnel_broker::{Args, Broker, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = Config::from_args(&args);

    info!("Tunnel Broker v{}", env!("CARGO_PKG_VERSION"));
    info!("Public URL base: {}", config.public_url);
    info!(
        "Session TTL: {:?}, request timeout: {:?}",
        config.session_ttl, config.request_timeout
    );

    let tunnel_listener = TcpListener::bind(&config.tunnel_addr)
        .await
        .with_context(|| format!("Failed to bind tunnel listener on {}", config.tunnel_addr))?;
    let ingress_listener = TcpListener::bind(&config.ingress_addr)
        .await
        .with_context(|| format!("Failed to bind ingress listener on {}", config.ingress_addr))?;

    let broker = Broker::new(config);

    // Run until interrupted
    tokio::select! {
        _ = run_tunnel_server(tunnel_listener, broker.clone()) => {
            error!("Tunnel server exited");
        }
        _ = run_ingress_server(ingress_listener, broker.clone()) => {
            error!("Ingress server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    info!("Shutting down with {} live session(s)", broker.store.len());
    Ok(())
}
