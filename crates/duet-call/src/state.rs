//! Call session records.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use duet_common::{CallType, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Offer sent, waiting for an answer.
    Calling,
    /// Offer received, waiting for the local user.
    Ringing,
    Connected,
    /// Transient; always followed by cleanup and `Idle`.
    Failed,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which side sent the original offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// The single live call of an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    /// Remote identity.
    pub target_id: String,
    pub caller_id: String,
    pub state: CallState,
    pub call_type: CallType,
    pub started_at: DateTime<Utc>,
    pub role: CallRole,
}

impl CallSession {
    pub fn outgoing(local_id: &str, target_id: &str, call_type: CallType) -> Self {
        Self {
            target_id: target_id.to_string(),
            caller_id: local_id.to_string(),
            state: CallState::Calling,
            call_type,
            started_at: Utc::now(),
            role: CallRole::Caller,
        }
    }

    pub fn incoming(from: &str, call_type: CallType) -> Self {
        Self {
            target_id: from.to_string(),
            caller_id: from.to_string(),
            state: CallState::Ringing,
            call_type,
            started_at: Utc::now(),
            role: CallRole::Callee,
        }
    }
}

/// Remote offer held while ringing.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub from: String,
    pub description: SessionDescription,
    pub call_type: CallType,
    pub expires_at: Instant,
}

impl PendingOffer {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}
