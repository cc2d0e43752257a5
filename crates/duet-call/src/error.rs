//! Error taxonomy for call negotiation.

use thiserror::Error;

use crate::media::TrackKind;

/// Failure opening a local capture device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{0} access denied")]
    PermissionDenied(TrackKind),

    #[error("{0} device is busy")]
    Busy(TrackKind),

    #[error("no {0} device found")]
    NotFound(TrackKind),

    #[error("{kind} device failed: {reason}")]
    Failed { kind: TrackKind, reason: String },
}

impl DeviceError {
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::PermissionDenied(kind) | Self::Busy(kind) | Self::NotFound(kind) => *kind,
            Self::Failed { kind, .. } => *kind,
        }
    }
}

/// Failure reported by a peer negotiation object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Candidate belongs to an earlier negotiation round (ufrag mismatch).
    #[error("ICE candidate from a stale negotiation round")]
    StaleCandidate,

    #[error("peer connection is closed")]
    Closed,

    #[error("peer backend error: {0}")]
    Backend(String),
}

impl PeerError {
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        Self::Backend(msg.to_string())
    }
}

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        match e {
            webrtc::Error::ErrConnectionClosed => Self::Closed,
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Errors surfaced by [`crate::CallHandle`] commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Local devices could not be opened; the call was aborted.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[from] DeviceError),

    /// Malformed or rejected session description.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("stale ICE candidate")]
    StaleIce,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("peer failure: {0}")]
    Peer(String),

    #[error("invalid call target {0:?}")]
    InvalidTarget(String),

    /// No local identity is registered.
    #[error("no local identity")]
    NoIdentity,

    /// The relay channel refused the outbound signal.
    #[error("signaling channel unavailable")]
    SignalingUnavailable,

    #[error("call engine stopped")]
    EngineStopped,
}

impl From<PeerError> for CallError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::StaleCandidate => Self::StaleIce,
            other => Self::Peer(other.to_string()),
        }
    }
}

impl From<duet_common::Error> for CallError {
    fn from(e: duet_common::Error) -> Self {
        Self::Negotiation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_candidate_maps_to_stale_ice() {
        assert_eq!(CallError::from(PeerError::StaleCandidate), CallError::StaleIce);
        assert!(matches!(
            CallError::from(PeerError::backend("boom")),
            CallError::Peer(_)
        ));
    }

    #[test]
    fn test_protocol_error_is_negotiation() {
        let err = CallError::from(duet_common::Error::protocol("empty sdp"));
        assert_eq!(err, CallError::Negotiation("protocol error: empty sdp".into()));
    }

    #[test]
    fn test_device_error_kind() {
        assert_eq!(
            DeviceError::PermissionDenied(TrackKind::Video).kind(),
            TrackKind::Video
        );
    }
}
