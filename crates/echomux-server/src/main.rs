//! Echomux server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port
//! echomux-server --bind 0.0.0.0:8080
//!
//! # Restrict browser origins and tighten the idle timeout
//! echomux-server --allow-origin https://app.example --idle-timeout 30
//! ```

use std::time::Duration;

use clap::Parser;
use echomux_core::ConnectionConfig;
use echomux_server::{Server, ServerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Concurrent WebSocket echo server
#[derive(Parser, Debug)]
#[command(name = "echomux-server")]
#[command(about = "Concurrent WebSocket echo server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Origin allowed during the upgrade handshake (repeatable; none allows all)
    #[arg(long = "allow-origin")]
    allow_origin: Vec<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Idle timeout in seconds before a silent connection is closed
    #[arg(long, default_value = "60")]
    idle_timeout: u64,

    /// Grace period in seconds granted to sessions during shutdown
    #[arg(long, default_value = "5")]
    grace_period: u64,

    /// Bound on each connection's outbound message queue
    #[arg(long, default_value = "64")]
    outbound_queue: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("echomux server starting");
    tracing::info!("binding to {}", args.bind);

    if args.allow_origin.is_empty() {
        tracing::warn!("no origin allow-list configured, accepting upgrades from any origin");
    }

    let config = ServerConfig {
        bind_addr: args.bind,
        allowed_origins: args.allow_origin,
        max_connections: args.max_connections,
        grace_period: Duration::from_secs(args.grace_period),
        connection: ConnectionConfig {
            idle_timeout: Duration::from_secs(args.idle_timeout),
            max_outbound_queue: args.outbound_queue,
        },
    };

    let server = Server::bind(config).await?;

    tracing::info!("server listening on {}", server.local_addr()?);

    let report = server
        .run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    if !report.is_clean() {
        tracing::warn!("{} sessions did not close within the grace period", report.forced.len());
    }

    Ok(())
}
