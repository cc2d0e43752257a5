//! Call negotiation for Duet.
//!
//! [`CallEngine`] runs the offer/answer state machine for one local
//! identity on top of a [`duet_signal::SignalingChannel`]. Media capture and
//! the peer connection sit behind the [`MediaDevices`] and [`PeerFactory`]
//! traits; [`SyntheticDevices`] and [`WebRtcPeerFactory`] are the shipped
//! implementations.

#![forbid(unsafe_code)]

pub mod collab;
pub mod engine;
pub mod error;
pub mod ice_queue;
pub mod media;
pub mod peer;
pub mod state;
pub mod webrtc_peer;

#[cfg(test)]
pub(crate) mod testing;

pub use collab::{IdentityProvider, Profile, ProfileLookup, StaticIdentity, StaticProfiles};
pub use engine::{CallEngine, CallHandle, IncomingCall, Notice, SignalSink, SignalSource};
pub use error::{CallError, DeviceError, PeerError};
pub use ice_queue::IceCandidateQueue;
pub use media::{
    LocalStream, LocalTrack, MediaDevices, MediaSession, RemoteStream, RemoteTrack,
    SyntheticDevices, TrackKind,
};
pub use peer::{IceConnectionState, PeerConnection, PeerEvent, PeerEventSender, PeerFactory};
pub use state::{CallRole, CallSession, CallState, PendingOffer};
pub use webrtc_peer::WebRtcPeerFactory;
