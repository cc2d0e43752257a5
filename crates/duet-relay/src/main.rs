use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use duet_common::config::ice_servers_from_env;
use duet_relay::config::{RelayConfig, DEFAULT_MAX_MESSAGE_BYTES};
use duet_relay::RelayState;

#[derive(Parser, Debug)]
#[command(name = "duet-relay")]
#[command(about = "Duet signaling relay")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DUET_RELAY_BIND", default_value = "0.0.0.0:7860")]
    bind: SocketAddr,

    /// Seconds without traffic before a connection is evicted.
    #[arg(long, env = "DUET_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    idle_timeout_secs: u64,

    /// Seconds between maintenance sweeps.
    #[arg(long, env = "DUET_RELAY_CLEANUP_INTERVAL_SECS", default_value_t = 30)]
    cleanup_interval_secs: u64,

    /// Maximum connection age in seconds. Unset disables the cap.
    #[arg(long, env = "DUET_RELAY_MAX_LIFETIME_SECS")]
    max_lifetime_secs: Option<u64>,

    /// Maximum accepted text frame size.
    #[arg(long, env = "DUET_RELAY_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    duet_common::init_tracing();

    let args = Args::parse();
    if args.cleanup_interval_secs == 0 {
        anyhow::bail!("cleanup interval must be at least one second");
    }

    let config = RelayConfig {
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        cleanup_interval: Duration::from_secs(args.cleanup_interval_secs),
        max_connection_lifetime: args.max_lifetime_secs.map(Duration::from_secs),
        max_message_bytes: args.max_message_bytes,
        ice_servers: ice_servers_from_env(),
    };
    info!(
        "idle timeout {:?}, sweep every {:?}, max lifetime {:?}",
        config.idle_timeout, config.cleanup_interval, config.max_connection_lifetime
    );

    let listener = TcpListener::bind(args.bind).await?;
    info!("Duet relay listening on {}", args.bind);

    duet_relay::serve(listener, RelayState::new(config), shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
