//! Shared relay state: live connections, presence records and counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use axum::extract::FromRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use duet_common::{CLOSE_GOING_AWAY, CLOSE_NORMAL};

use crate::config::RelayConfig;
use crate::signal::close_message;

/// One live signaling connection.
#[derive(Debug)]
pub struct Peer {
    pub conn_id: Uuid,
    pub tx: mpsc::Sender<Message>,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

pub type ConnectionMap = Arc<RwLock<HashMap<String, Peer>>>;
pub type PresenceMap = Arc<RwLock<HashMap<String, Presence>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Presence {
    pub fn online() -> Self {
        Self {
            status: PresenceStatus::Online,
            last_seen: Some(Utc::now()),
        }
    }

    pub fn offline() -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen: Some(Utc::now()),
        }
    }

    /// Record for an identity the relay has never seen.
    pub fn unknown() -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen: None,
        }
    }
}

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    pub total_connections: AtomicU64,
    pub messages_relayed: AtomicU64,
    pub errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            total_connections: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct RelayState {
    pub connections: ConnectionMap,
    pub presence: PresenceMap,
    pub metrics: Arc<Metrics>,
    pub config: Arc<RelayConfig>,
}

impl FromRef<RelayState> for ConnectionMap {
    fn from_ref(state: &RelayState) -> Self {
        state.connections.clone()
    }
}

impl FromRef<RelayState> for PresenceMap {
    fn from_ref(state: &RelayState) -> Self {
        state.presence.clone()
    }
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            presence: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(Metrics::default()),
            config: Arc::new(config),
        }
    }

    /// Register a connection, closing any older one for the same identity.
    pub async fn register(&self, user_id: &str, tx: mpsc::Sender<Message>) -> Uuid {
        let conn_id = Uuid::new_v4();
        let now = Instant::now();
        let previous = self.connections.write().await.insert(
            user_id.to_string(),
            Peer {
                conn_id,
                tx,
                connected_at: now,
                last_seen: now,
            },
        );
        if let Some(previous) = previous {
            info!("replacing existing connection for {}", user_id);
            let _ = previous
                .tx
                .try_send(close_message(CLOSE_NORMAL, "replaced by a newer connection"));
        }
        self.metrics.total_connections.fetch_add(1, Ordering::Relaxed);
        self.presence
            .write()
            .await
            .insert(user_id.to_string(), Presence::online());
        conn_id
    }

    /// Refresh last-seen for the connection that owns `conn_id`.
    pub async fn touch(&self, user_id: &str, conn_id: Uuid) {
        let mut guard = self.connections.write().await;
        if let Some(peer) = guard.get_mut(user_id) {
            if peer.conn_id == conn_id {
                peer.last_seen = Instant::now();
            }
        }
    }

    /// Drop the connection if it is still the registered one. Returns whether it was.
    pub async fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let removed = {
            let mut guard = self.connections.write().await;
            match guard.get(user_id) {
                Some(peer) if peer.conn_id == conn_id => guard.remove(user_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.presence
                .write()
                .await
                .insert(user_id.to_string(), Presence::offline());
        }
        removed
    }

    pub async fn sender_for(&self, user_id: &str) -> Option<mpsc::Sender<Message>> {
        let guard = self.connections.read().await;
        guard.get(user_id).map(|peer| peer.tx.clone())
    }

    /// Connected identities, sorted.
    pub async fn connected_users(&self) -> Vec<String> {
        let guard = self.connections.read().await;
        let mut users: Vec<String> = guard.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn active_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn presence_of(&self, user_id: &str) -> Presence {
        self.presence
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(Presence::unknown)
    }

    /// Disconnect idle and over-age connections with 1001 so clients reconnect.
    pub async fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let max_lifetime = self.config.max_connection_lifetime;

        let stale: Vec<(String, Peer)> = {
            let mut guard = self.connections.write().await;
            let ids: Vec<String> = guard
                .iter()
                .filter(|(_, peer)| {
                    now.duration_since(peer.last_seen) > idle_timeout
                        || max_lifetime
                            .is_some_and(|max| now.duration_since(peer.connected_at) > max)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| guard.remove(&id).map(|peer| (id, peer)))
                .collect()
        };

        if stale.is_empty() {
            return 0;
        }
        let mut presence = self.presence.write().await;
        for (user_id, peer) in &stale {
            debug!("evicting stale connection for {}", user_id);
            let _ = peer
                .tx
                .try_send(close_message(CLOSE_GOING_AWAY, "connection idle"));
            presence.insert(user_id.clone(), Presence::offline());
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outbox() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(8)
    }

    fn close_code(msg: Message) -> Option<u16> {
        match msg {
            Message::Close(Some(frame)) => Some(frame.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_register_replaces_and_closes_previous() {
        let state = RelayState::new(RelayConfig::default());
        let (tx1, mut rx1) = outbox();
        let (tx2, _rx2) = outbox();

        let first = state.register("alice", tx1).await;
        let second = state.register("alice", tx2).await;
        assert_ne!(first, second);
        assert_eq!(close_code(rx1.recv().await.expect("close")), Some(CLOSE_NORMAL));

        // The replaced handler's cleanup must not evict the newer connection.
        assert!(!state.unregister("alice", first).await);
        assert_eq!(state.connected_users().await, vec!["alice".to_string()]);
        assert!(state.unregister("alice", second).await);
        assert!(state.connected_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_presence_transitions() {
        let state = RelayState::new(RelayConfig::default());
        assert_eq!(state.presence_of("bob").await, Presence::unknown());

        let (tx, _rx) = outbox();
        let conn = state.register("bob", tx).await;
        assert_eq!(state.presence_of("bob").await.status, PresenceStatus::Online);

        state.unregister("bob", conn).await;
        let presence = state.presence_of("bob").await;
        assert_eq!(presence.status, PresenceStatus::Offline);
        assert!(presence.last_seen.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_connections() {
        let state = RelayState::new(RelayConfig {
            idle_timeout: Duration::from_secs(90),
            ..RelayConfig::default()
        });
        let (idle_tx, mut idle_rx) = outbox();
        let (busy_tx, _busy_rx) = outbox();
        state.register("idle", idle_tx).await;
        let busy = state.register("busy", busy_tx).await;

        tokio::time::advance(Duration::from_secs(60)).await;
        state.touch("busy", busy).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(state.evict_stale().await, 1);
        assert_eq!(
            close_code(idle_rx.recv().await.expect("close")),
            Some(CLOSE_GOING_AWAY)
        );
        assert_eq!(state.connected_users().await, vec!["busy".to_string()]);
        assert_eq!(state.presence_of("idle").await.status, PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_lifetime_disabled_by_default() {
        let state = RelayState::new(RelayConfig::default());
        let (tx, _rx) = outbox();
        let conn = state.register("alice", tx).await;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(60)).await;
            state.touch("alice", conn).await;
        }
        assert_eq!(state.evict_stale().await, 0);

        let capped = RelayState::new(RelayConfig {
            max_connection_lifetime: Some(Duration::from_secs(300)),
            ..RelayConfig::default()
        });
        let (tx, _rx) = outbox();
        let conn = capped.register("alice", tx).await;
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(60)).await;
            capped.touch("alice", conn).await;
        }
        assert_eq!(capped.evict_stale().await, 1);
    }
}
