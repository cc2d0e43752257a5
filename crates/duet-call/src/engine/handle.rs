//! Public surface of a running call engine.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use duet_common::{CallType, SignalType};
use duet_signal::{ChannelEvent, SignalingChannel, Subscription};

use crate::error::CallError;
use crate::media::{LocalStream, RemoteStream};
use crate::state::{CallSession, CallState};

/// Outbound half of the signaling channel as the engine sees it.
pub trait SignalSink: Send + Sync {
    /// Fire-and-forget; `false` when the message could not be queued.
    fn send(&self, target_id: &str, kind: SignalType, payload: Option<Value>) -> bool;
}

impl SignalSink for SignalingChannel {
    fn send(&self, target_id: &str, kind: SignalType, payload: Option<Value>) -> bool {
        SignalingChannel::send(self, target_id, kind, payload)
    }
}

/// Inbound half of the signaling channel. `next_event` must be cancel-safe.
#[async_trait]
pub trait SignalSource: Send {
    async fn next_event(&mut self) -> Option<ChannelEvent>;
}

#[async_trait]
impl SignalSource for Subscription {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.recv().await
    }
}

#[async_trait]
impl SignalSource for mpsc::UnboundedReceiver<ChannelEvent> {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.recv().await
    }
}

/// An offer waiting for the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from: String,
    pub call_type: CallType,
}

/// User-visible outcome of a call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    CallFailed { peer: String, reason: String },
    CallRejected { peer: String },
    CallEnded { peer: String },
    DeviceAccessDenied { reason: String },
    /// Video was requested but the call continues audio-only.
    CameraUnavailable,
    NoAnswer { peer: String },
    MissedCall { peer: String },
    PeerUnavailable { peer: String, online: Vec<String> },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CallFailed { peer, reason } => write!(f, "call with {peer} failed: {reason}"),
            Self::CallRejected { peer } => write!(f, "{peer} declined the call"),
            Self::CallEnded { peer } => write!(f, "{peer} ended the call"),
            Self::DeviceAccessDenied { reason } => write!(f, "cannot access devices: {reason}"),
            Self::CameraUnavailable => f.write_str("camera unavailable, continuing with audio only"),
            Self::NoAnswer { peer } => write!(f, "{peer} did not answer"),
            Self::MissedCall { peer } => write!(f, "missed call from {peer}"),
            Self::PeerUnavailable { peer, .. } => write!(f, "{peer} is not online"),
        }
    }
}

pub(crate) enum Command {
    Call {
        target: String,
        call_type: CallType,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        user_initiated: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Cloneable control and observation handle. The engine stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct CallHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) state: watch::Receiver<CallState>,
    pub(crate) session: watch::Receiver<Option<CallSession>>,
    pub(crate) local_stream: watch::Receiver<Option<LocalStream>>,
    pub(crate) remote_stream: watch::Receiver<Option<RemoteStream>>,
    pub(crate) incoming: broadcast::Sender<IncomingCall>,
    pub(crate) notices: broadcast::Sender<Notice>,
}

impl CallHandle {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), CallError>>) -> Command,
    ) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }

    /// Start an outgoing call. Ignored unless idle.
    pub async fn call(&self, target: &str, call_type: CallType) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|reply| Command::Call {
            target,
            call_type,
            reply,
        })
        .await
    }

    /// Answer the ringing call. Ignored unless ringing.
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hang up. The peer is told only when `user_initiated` is set.
    pub async fn end(&self, user_initiated: bool) -> Result<(), CallError> {
        self.request(|reply| Command::End {
            user_initiated,
            reply,
        })
        .await
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn session(&self) -> Option<CallSession> {
        self.session.borrow().clone()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.local_stream.borrow().clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.remote_stream.borrow().clone()
    }

    pub fn watch_remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.remote_stream.clone()
    }

    pub fn incoming_calls(&self) -> broadcast::Receiver<IncomingCall> {
        self.incoming.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}
