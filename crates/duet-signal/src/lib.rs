//! Signaling channel for Duet.
//!
//! A [`SignalingChannel`] owns at most one relay connection for one local
//! identity. It keeps the connection alive with heartbeats, reconnects once
//! after abnormal closes, and fans inbound messages out to subscribers.

#![forbid(unsafe_code)]

pub mod channel;
pub mod transport;

pub use channel::{ChannelEvent, ConnectionState, SignalingChannel, Subscription};
pub use transport::{Connector, Frame, Transport, WsConnector};
