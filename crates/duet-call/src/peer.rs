//! Peer negotiation seam.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use duet_common::{IceCandidate, SessionDescription};

use crate::error::PeerError;
use crate::media::{LocalTrack, RemoteTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
    IceState(IceConnectionState),
    RemoteTrack {
        track: RemoteTrack,
        stream_id: Option<String>,
    },
}

/// Event sink handed to a peer. Every event is tagged with the negotiation
/// round the peer was created for, so late events from a closed peer can be
/// told apart from the current one.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    round: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSender {
    pub fn new(round: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { round, tx }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn emit(&self, event: PeerEvent) {
        if self.tx.send((self.round, event)).is_err() {
            trace!("peer event dropped; engine is gone");
        }
    }
}

/// One negotiation object. `create_offer`, `create_answer` and
/// `restart_ice` also install the result as the local description.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add a local track on a new transceiver.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Add a local track on the transceiver the remote offer created for
    /// its kind, when there is one.
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// New offer with fresh ICE credentials.
    async fn restart_ice(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: &SessionDescription)
        -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
