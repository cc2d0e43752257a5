//! HTTP endpoints: health, presence and ICE configuration.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use duet_common::config::IceServer;

use crate::state::{Presence, PresenceMap, RelayState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_relayed: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceList {
    pub users: HashMap<String, Presence>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfigResponse {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

pub async fn health(State(state): State<RelayState>) -> Json<HealthReport> {
    let metrics = &state.metrics;
    Json(HealthReport {
        status: "healthy".to_string(),
        active_connections: state.active_connections().await,
        total_connections: metrics.total_connections.load(Ordering::Relaxed),
        messages_relayed: metrics.messages_relayed.load(Ordering::Relaxed),
        errors: metrics.errors.load(Ordering::Relaxed),
        uptime_secs: metrics.uptime_secs(),
    })
}

pub async fn presence(
    Path(user_id): Path<String>,
    State(state): State<RelayState>,
) -> Json<Presence> {
    Json(state.presence_of(user_id.trim()).await)
}

pub async fn all_presence(State(presence): State<PresenceMap>) -> Json<PresenceList> {
    let users = presence.read().await.clone();
    let count = users.len();
    Json(PresenceList { users, count })
}

pub async fn ice_servers(State(state): State<RelayState>) -> Json<IceConfigResponse> {
    Json(IceConfigResponse {
        ice_servers: state.config.ice_servers.clone(),
    })
}
