//! Duet signaling relay.
//!
//! Routes JSON signaling frames between identities connected on
//! `/ws/:user_id`, tracks presence, and evicts idle connections.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod signal;
pub mod state;

use std::future::Future;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::RelayConfig;
pub use state::{Presence, PresenceStatus, RelayState};

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(|| async { "Duet relay online" }))
        .route("/health", get(api::health))
        .route("/api/presence", get(api::all_presence))
        .route("/api/presence/:user_id", get(api::presence))
        .route("/api/ice-servers", get(api::ice_servers))
        .route("/ws/:user_id", get(signal::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically evict idle and over-age connections.
pub fn spawn_maintenance(state: RelayState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(state.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = state.evict_stale().await;
            if evicted > 0 {
                info!("evicted {} stale connection(s)", evicted);
            }
        }
    })
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let maintenance = spawn_maintenance(state.clone());
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    maintenance.abort();
    result?;
    Ok(())
}
