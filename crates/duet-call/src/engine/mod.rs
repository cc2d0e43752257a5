//! Call negotiation state machine.
//!
//! One task owns all call state and handles, one at a time, UI commands,
//! signaling events, peer events and timer expiries. Transitions:
//!
//! - `Idle -> Calling`: media acquired, peer created, offer sent, response
//!   timer armed.
//! - `Idle -> Ringing`: offer stored with an expiry; no media, no peer.
//! - `Ringing -> Connected`: media acquired, offer applied, local tracks
//!   attached, queued candidates flushed, answer sent.
//! - `Calling -> Connected`: answer applied, queued candidates flushed.
//! - anything `-> Idle` (possibly through `Failed`): the single teardown path
//!   closes the peer, stops local tracks, clears the candidate queue, drops
//!   the pending offer and cancels timers.
//!
//! Timers and peer callbacks carry the round they were created in. Teardown
//! starts a new round, so a late event from an earlier attempt is ignored.

mod handle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use duet_common::config::Timings;
use duet_common::helpers::is_valid_identity;
use duet_common::relay_errors::TARGET_NOT_CONNECTED;
use duet_common::{CallType, IceCandidate, SdpType, SessionDescription, SignalMessage, SignalType};
use duet_signal::ChannelEvent;

pub use handle::{CallHandle, IncomingCall, Notice, SignalSink, SignalSource};

use crate::collab::IdentityProvider;
use crate::error::{CallError, PeerError};
use crate::ice_queue::IceCandidateQueue;
use crate::media::{LocalStream, MediaDevices, MediaSession, RemoteStream};
use crate::peer::{IceConnectionState, PeerConnection, PeerEvent, PeerEventSender, PeerFactory};
use crate::state::{CallRole, CallSession, CallState, PendingOffer};
use handle::Command;

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    ResponseTimeout,
    OfferExpired,
    IceFailedGrace,
}

struct Timers {
    tx: mpsc::UnboundedSender<(u64, TimerKind)>,
    armed: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    fn arm(&mut self, kind: TimerKind, round: u64, delay: Duration) {
        self.cancel(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send((round, kind));
        });
        self.armed.insert(kind, handle);
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.armed.remove(&kind) {
            handle.abort();
        }
    }

    fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }
}

/// Owns the call of one local identity. Build with [`CallEngine::new`],
/// then drive with [`CallEngine::run`] or [`CallEngine::spawn`].
pub struct CallEngine {
    identity: Arc<dyn IdentityProvider>,
    signal: Arc<dyn SignalSink>,
    peers: Arc<dyn PeerFactory>,
    timings: Timings,
    media: MediaSession,

    session: Option<CallSession>,
    pending: Option<PendingOffer>,
    peer: Option<Arc<dyn PeerConnection>>,
    ice: IceCandidateQueue,
    round: u64,
    timers: Timers,
    /// Set once per disconnect episode, cleared when ICE recovers.
    restart_attempted: bool,
    /// A restart offer is out and its answer has not been applied yet.
    restart_pending: bool,

    commands: mpsc::UnboundedReceiver<Command>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    timer_rx: mpsc::UnboundedReceiver<(u64, TimerKind)>,

    state_tx: watch::Sender<CallState>,
    session_tx: watch::Sender<Option<CallSession>>,
    local_tx: watch::Sender<Option<LocalStream>>,
    remote_tx: watch::Sender<Option<RemoteStream>>,
    incoming_tx: broadcast::Sender<IncomingCall>,
    notice_tx: broadcast::Sender<Notice>,
}

impl CallEngine {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        signal: Arc<dyn SignalSink>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
        timings: Timings,
    ) -> (Self, CallHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (session_tx, session_rx) = watch::channel(None);
        let (local_tx, local_rx) = watch::channel(None);
        let (remote_tx, remote_rx) = watch::channel(None);
        let (incoming_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (notice_tx, _) = broadcast::channel(EVENT_BUFFER);

        let handle = CallHandle {
            commands: command_tx,
            state: state_rx,
            session: session_rx,
            local_stream: local_rx,
            remote_stream: remote_rx,
            incoming: incoming_tx.clone(),
            notices: notice_tx.clone(),
        };

        let engine = Self {
            identity,
            signal,
            peers,
            timings,
            media: MediaSession::new(devices),
            session: None,
            pending: None,
            peer: None,
            ice: IceCandidateQueue::new(),
            round: 0,
            timers: Timers {
                tx: timer_tx,
                armed: HashMap::new(),
            },
            restart_attempted: false,
            restart_pending: false,
            commands,
            peer_tx,
            peer_rx,
            timer_rx,
            state_tx,
            session_tx,
            local_tx,
            remote_tx,
            incoming_tx,
            notice_tx,
        };
        (engine, handle)
    }

    pub fn spawn(self, source: impl SignalSource + 'static) -> JoinHandle<()> {
        tokio::spawn(self.run(Box::new(source)))
    }

    /// Process events until every [`CallHandle`] is dropped.
    pub async fn run(mut self, mut source: Box<dyn SignalSource>) {
        let mut source_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = source.next_event(), if source_open => match event {
                    Some(event) => self.handle_channel_event(event).await,
                    None => {
                        warn!("signaling subscription closed");
                        source_open = false;
                    }
                },
                Some((round, event)) = self.peer_rx.recv() => {
                    self.handle_peer_event(round, event).await;
                }
                Some((round, kind)) = self.timer_rx.recv() => {
                    self.handle_timer(round, kind).await;
                }
            }
        }
        debug!("call engine stopping");
        self.teardown().await;
    }

    fn state(&self) -> CallState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: CallState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("call state {} -> {}", previous, state);
        }
        self.session_tx.send_replace(self.session.clone());
    }

    fn notify(&self, notice: Notice) {
        info!("notice: {}", notice);
        let _ = self.notice_tx.send(notice);
    }

    fn peer_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.target_id.clone())
    }

    fn is_peer(&self, identity: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.target_id == identity)
    }

    fn call_type(&self) -> CallType {
        self.session
            .as_ref()
            .map(|s| s.call_type)
            .unwrap_or_default()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                target,
                call_type,
                reply,
            } => {
                let result = self.start_call(&target, call_type).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            Command::Reject { reply } => {
                self.reject().await;
                let _ = reply.send(Ok(()));
            }
            Command::End {
                user_initiated,
                reply,
            } => {
                self.end_call(user_initiated).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected(true) => debug!("signaling available"),
            ChannelEvent::Connected(false) => {
                debug!("signaling lost; call state unchanged ({})", self.state())
            }
            ChannelEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: SignalMessage) {
        match message.kind {
            SignalType::Offer => self.on_offer(message).await,
            SignalType::Answer => self.on_answer(message).await,
            SignalType::IceCandidate => self.on_remote_candidate(message).await,
            SignalType::CallEnded => self.on_remote_hangup(message, false).await,
            SignalType::CallRejected => self.on_remote_hangup(message, true).await,
            SignalType::Error => self.on_relay_error(message).await,
            SignalType::OfferSent => {
                debug!("offer delivered to {:?}", message.target_id);
            }
            SignalType::CallRequest | SignalType::CallAccepted => {
                debug!("{} from {:?} needs no action", message.kind, message.sender_id);
            }
            SignalType::Ping | SignalType::Pong | SignalType::Unknown => {}
        }
    }

    async fn start_call(&mut self, target: &str, call_type: CallType) -> Result<(), CallError> {
        if !self.state().is_idle() {
            debug!("call to {} ignored while {}", target, self.state());
            return Ok(());
        }
        let local_id = self
            .identity
            .local_identity()
            .ok_or(CallError::NoIdentity)?;
        let target = target.trim();
        if !is_valid_identity(target) || target == local_id {
            return Err(CallError::InvalidTarget(target.to_string()));
        }

        self.session = Some(CallSession::outgoing(&local_id, target, call_type));
        self.set_state(CallState::Calling);
        info!("calling {} ({})", target, call_type);

        let acquired = match self.media.acquire(call_type).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.notify(Notice::DeviceAccessDenied {
                    reason: e.to_string(),
                });
                self.fail(None).await;
                return Err(e.into());
            }
        };
        if acquired.degraded {
            self.notify(Notice::CameraUnavailable);
        }
        self.apply_effective_call_type(acquired.call_type);
        self.local_tx.send_replace(Some(acquired.stream.clone()));

        let offer = match self.create_offer(&acquired.stream).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(Some(Notice::CallFailed {
                    peer: target.to_string(),
                    reason: e.to_string(),
                }))
                .await;
                return Err(e);
            }
        };

        let payload = offer.with_call_type(acquired.call_type).to_payload();
        if !self.signal.send(target, SignalType::Offer, Some(payload)) {
            self.fail(Some(Notice::CallFailed {
                peer: target.to_string(),
                reason: "signaling unavailable".into(),
            }))
            .await;
            return Err(CallError::SignalingUnavailable);
        }
        self.timers.arm(
            TimerKind::ResponseTimeout,
            self.round,
            self.timings.response_timeout,
        );
        Ok(())
    }

    /// Record what the local stream actually carries after a degraded acquire.
    fn apply_effective_call_type(&mut self, call_type: CallType) {
        if let Some(session) = self.session.as_mut() {
            session.call_type = call_type;
        }
        self.session_tx.send_replace(self.session.clone());
    }

    async fn new_peer(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        let events = PeerEventSender::new(self.round, self.peer_tx.clone());
        let peer = self.peers.create(events).await?;
        self.peer = Some(Arc::clone(&peer));
        Ok(peer)
    }

    async fn create_offer(&mut self, stream: &LocalStream) -> Result<SessionDescription, CallError> {
        let peer = self.new_peer().await?;
        for track in &stream.tracks {
            peer.add_track(track).await?;
        }
        Ok(peer.create_offer().await?)
    }

    async fn on_offer(&mut self, message: SignalMessage) {
        let Some(from) = message.sender_id.clone() else {
            warn!("offer without sender ignored");
            return;
        };
        let payload = message.payload.as_ref().unwrap_or(&Value::Null);
        let description = match SessionDescription::from_payload(payload, SdpType::Offer) {
            Ok(description) => description,
            Err(e) => {
                warn!("malformed offer from {}: {}", from, e);
                if self.state().is_idle() {
                    self.signal.send(
                        &from,
                        SignalType::CallRejected,
                        Some(json!({ "reason": "negotiation-failed" })),
                    );
                } else if self.is_peer(&from) {
                    self.abort_negotiation(e.to_string()).await;
                }
                return;
            }
        };

        match self.state() {
            CallState::Idle => self.ring(from, description),
            CallState::Calling if self.is_peer(&from) => {
                self.resolve_glare(from, description).await
            }
            CallState::Connected if self.is_peer(&from) => self.renegotiate(description).await,
            state => debug!("offer from {} ignored while {}", from, state),
        }
    }

    fn ring(&mut self, from: String, description: SessionDescription) {
        let call_type = description.call_type.unwrap_or_default();
        self.ice.clear();
        self.pending = Some(PendingOffer {
            from: from.clone(),
            description,
            call_type,
            expires_at: Instant::now() + self.timings.offer_expiry,
        });
        self.session = Some(CallSession::incoming(&from, call_type));
        self.timers.arm(
            TimerKind::OfferExpired,
            self.round,
            self.timings.offer_expiry,
        );
        self.set_state(CallState::Ringing);
        info!("incoming {} call from {}", call_type, from);
        let _ = self.incoming_tx.send(IncomingCall { from, call_type });
    }

    /// Both sides called each other. The lower identity drops its own
    /// attempt without telling the peer and answers theirs instead.
    async fn resolve_glare(&mut self, from: String, description: SessionDescription) {
        let local = self
            .session
            .as_ref()
            .map(|s| s.caller_id.clone())
            .unwrap_or_default();
        if local.as_str() < from.as_str() {
            info!("simultaneous call with {}; yielding", from);
            self.teardown().await;
            self.ring(from, description);
        } else {
            debug!("simultaneous call with {}; keeping our offer", from);
        }
    }

    async fn renegotiate(&mut self, description: SessionDescription) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        debug!("renegotiating with {:?}", self.peer_id());
        let answer: Result<SessionDescription, PeerError> = async {
            peer.set_remote_description(&description).await?;
            peer.create_answer().await
        }
        .await;
        match answer {
            Ok(answer) => {
                self.ice.mark_ready();
                self.ice.flush(peer.as_ref()).await;
                if let Some(target) = self.peer_id() {
                    let payload = answer.with_call_type(self.call_type()).to_payload();
                    self.signal.send(&target, SignalType::Answer, Some(payload));
                }
            }
            Err(e) => self.abort_negotiation(e.to_string()).await,
        }
    }

    async fn on_answer(&mut self, message: SignalMessage) {
        let Some(from) = message.sender_id.as_deref() else {
            return;
        };
        let state = self.state();
        let restarting = state == CallState::Connected
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.role == CallRole::Caller);
        if !self.is_peer(from) || !(state == CallState::Calling || restarting) {
            debug!("answer from {} ignored while {}", from, state);
            return;
        }
        if restarting && !self.restart_pending {
            debug!("answer from {} without an outstanding ICE restart ignored", from);
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };

        let payload = message.payload.as_ref().unwrap_or(&Value::Null);
        let applied = match SessionDescription::from_payload(payload, SdpType::Answer) {
            Ok(description) => peer
                .set_remote_description(&description)
                .await
                .map_err(CallError::from),
            Err(e) => Err(CallError::from(e)),
        };
        if let Err(e) = applied {
            warn!("cannot apply answer from {}: {}", from, e);
            self.abort_negotiation(e.to_string()).await;
            return;
        }

        self.restart_pending = false;
        self.ice.mark_ready();
        self.ice.flush(peer.as_ref()).await;
        if state == CallState::Calling {
            self.timers.cancel(TimerKind::ResponseTimeout);
            if let Some(session) = self.session.as_mut() {
                session.started_at = Utc::now();
            }
            self.set_state(CallState::Connected);
        } else {
            debug!("ICE restart answer applied");
        }
    }

    async fn on_remote_candidate(&mut self, message: SignalMessage) {
        let Some(from) = message.sender_id.as_deref() else {
            return;
        };
        if !self.is_peer(from) {
            debug!("candidate from {} outside the current call", from);
            return;
        }
        let candidate: IceCandidate = match message.payload_as() {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!("unusable candidate from {}: {}", from, e);
                return;
            }
        };

        match (self.ice.is_ready(), self.peer.clone()) {
            (true, Some(peer)) => match peer.add_ice_candidate(&candidate).await {
                Ok(()) => {}
                Err(PeerError::StaleCandidate) => {
                    debug!("discarding candidate from a previous negotiation round")
                }
                Err(e) => warn!("failed to apply ICE candidate: {}", e),
            },
            _ => self.ice.enqueue(candidate),
        }
    }

    async fn on_remote_hangup(&mut self, message: SignalMessage, rejected: bool) {
        let Some(peer) = message.sender_id else {
            return;
        };
        if !self.is_peer(&peer) {
            debug!("{} from {} outside the current call", message.kind, peer);
            return;
        }
        let notice = match (self.state(), rejected) {
            (CallState::Ringing, _) => Notice::MissedCall { peer },
            (_, true) => Notice::CallRejected { peer },
            _ => Notice::CallEnded { peer },
        };
        self.notify(notice);
        self.teardown().await;
    }

    async fn on_relay_error(&mut self, message: SignalMessage) {
        let error_type = message.error_type.as_deref().unwrap_or("UNKNOWN");
        let text = message.message.as_deref().unwrap_or_default();
        if error_type == TARGET_NOT_CONNECTED && self.state() == CallState::Calling {
            let names_peer = message
                .target_id
                .as_deref()
                .map_or(true, |target| self.is_peer(target));
            if let (true, Some(peer)) = (names_peer, self.peer_id()) {
                warn!("{} is not connected: {}", peer, text);
                let online = message.available_users.unwrap_or_default();
                self.fail(Some(Notice::PeerUnavailable { peer, online }))
                    .await;
                return;
            }
        }
        warn!("relay error {}: {}", error_type, text);
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        if self.state() != CallState::Ringing {
            debug!("accept ignored while {}", self.state());
            return Ok(());
        }
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if pending.is_expired() {
            let reason = format!("offer from {} expired", pending.from);
            self.expire_offer(pending.from).await;
            return Err(CallError::Timeout(reason));
        }
        self.timers.cancel(TimerKind::OfferExpired);
        let from = pending.from.clone();

        let acquired = match self.media.acquire(pending.call_type).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.signal.send(
                    &from,
                    SignalType::CallRejected,
                    Some(json!({ "reason": "media-unavailable" })),
                );
                self.notify(Notice::DeviceAccessDenied {
                    reason: e.to_string(),
                });
                self.fail(None).await;
                return Err(e.into());
            }
        };
        if acquired.degraded {
            self.notify(Notice::CameraUnavailable);
        }
        self.apply_effective_call_type(acquired.call_type);
        self.local_tx.send_replace(Some(acquired.stream.clone()));

        let answer = match self.answer_offer(&pending.description, &acquired.stream).await {
            Ok(answer) => answer,
            Err(e) => {
                self.abort_negotiation(e.to_string()).await;
                return Err(e);
            }
        };
        let payload = answer.with_call_type(acquired.call_type).to_payload();
        if !self.signal.send(&from, SignalType::Answer, Some(payload)) {
            self.fail(Some(Notice::CallFailed {
                peer: from,
                reason: "signaling unavailable".into(),
            }))
            .await;
            return Err(CallError::SignalingUnavailable);
        }

        if let Some(session) = self.session.as_mut() {
            session.started_at = Utc::now();
        }
        self.set_state(CallState::Connected);
        Ok(())
    }

    async fn answer_offer(
        &mut self,
        offer: &SessionDescription,
        stream: &LocalStream,
    ) -> Result<SessionDescription, CallError> {
        let peer = self.new_peer().await?;
        peer.set_remote_description(offer).await?;
        for track in &stream.tracks {
            peer.attach_track(track).await?;
        }
        self.ice.mark_ready();
        self.ice.flush(peer.as_ref()).await;
        Ok(peer.create_answer().await?)
    }

    async fn reject(&mut self) {
        if self.state() != CallState::Ringing {
            debug!("reject ignored while {}", self.state());
            return;
        }
        if let Some(from) = self.peer_id() {
            info!("rejecting call from {}", from);
            self.signal.send(&from, SignalType::CallRejected, None);
        }
        self.teardown().await;
    }

    async fn end_call(&mut self, user_initiated: bool) {
        if self.session.is_none() {
            return;
        }
        if user_initiated {
            if let Some(peer) = self.peer_id() {
                self.signal.send(&peer, SignalType::CallEnded, None);
            }
        }
        self.teardown().await;
    }

    async fn expire_offer(&mut self, from: String) {
        info!("offer from {} expired", from);
        self.fail(Some(Notice::MissedCall { peer: from })).await;
    }

    /// Negotiation cannot continue: tell the peer, then fail.
    async fn abort_negotiation(&mut self, reason: String) {
        let Some(peer) = self.peer_id() else {
            return;
        };
        self.signal.send(
            &peer,
            SignalType::CallEnded,
            Some(json!({ "reason": "negotiation-failed" })),
        );
        self.fail(Some(Notice::CallFailed { peer, reason })).await;
    }

    async fn handle_peer_event(&mut self, round: u64, event: PeerEvent) {
        if round != self.round || self.peer.is_none() {
            trace!("dropping peer event from round {}", round);
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(target) = self.peer_id() {
                    self.signal.send(
                        &target,
                        SignalType::IceCandidate,
                        Some(candidate.to_payload()),
                    );
                }
            }
            PeerEvent::IceState(state) => self.on_ice_state(state).await,
            PeerEvent::RemoteTrack { track, stream_id } => {
                let stream = self.media.on_remote_track(track, stream_id.as_deref());
                self.remote_tx.send_replace(Some(stream));
            }
        }
    }

    async fn on_ice_state(&mut self, state: IceConnectionState) {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.timers.cancel(TimerKind::IceFailedGrace);
                self.restart_attempted = false;
            }
            IceConnectionState::Disconnected if self.state() == CallState::Connected => {
                warn!("ICE disconnected; attempting recovery");
                self.restart_ice().await;
            }
            IceConnectionState::Failed if self.state() == CallState::Connected => {
                if !self.timers.is_armed(TimerKind::IceFailedGrace) {
                    warn!(
                        "ICE failed; tearing down in {:?} unless it recovers",
                        self.timings.ice_failed_grace
                    );
                    self.timers.arm(
                        TimerKind::IceFailedGrace,
                        self.round,
                        self.timings.ice_failed_grace,
                    );
                }
                self.restart_ice().await;
            }
            _ => {}
        }
    }

    /// At most one restart per disconnect episode, issued by the original
    /// offerer only.
    async fn restart_ice(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.role != CallRole::Caller {
            debug!("waiting for {} to restart ICE", session.target_id);
            return;
        }
        if self.restart_attempted {
            return;
        }
        if self.restart_pending {
            debug!("ICE restart to {} still awaiting an answer", session.target_id);
            return;
        }
        self.restart_attempted = true;
        let target = session.target_id.clone();
        let call_type = session.call_type;
        let Some(peer) = self.peer.clone() else {
            return;
        };
        match peer.restart_ice().await {
            Ok(offer) => {
                let payload = offer.with_call_type(call_type).to_payload();
                if self.signal.send(&target, SignalType::Offer, Some(payload)) {
                    info!("sent ICE restart offer to {}", target);
                    self.restart_pending = true;
                }
            }
            Err(e) => warn!("ICE restart failed: {}", e),
        }
    }

    async fn handle_timer(&mut self, round: u64, kind: TimerKind) {
        if round != self.round {
            trace!("dropping {:?} from round {}", kind, round);
            return;
        }
        self.timers.armed.remove(&kind);
        match (kind, self.state()) {
            (TimerKind::ResponseTimeout, CallState::Calling) => {
                let Some(peer) = self.peer_id() else {
                    return;
                };
                warn!("no answer from {}", peer);
                self.signal.send(
                    &peer,
                    SignalType::CallEnded,
                    Some(json!({ "reason": "timeout" })),
                );
                self.fail(Some(Notice::NoAnswer { peer })).await;
            }
            (TimerKind::OfferExpired, CallState::Ringing) => {
                if let Some(from) = self.peer_id() {
                    self.expire_offer(from).await;
                }
            }
            (TimerKind::IceFailedGrace, CallState::Connected) => {
                let Some(peer) = self.peer_id() else {
                    return;
                };
                self.signal.send(
                    &peer,
                    SignalType::CallEnded,
                    Some(json!({ "reason": "connection-failed" })),
                );
                self.fail(Some(Notice::CallFailed {
                    peer,
                    reason: "ICE connection failed".into(),
                }))
                .await;
            }
            (kind, state) => trace!("{:?} ignored while {}", kind, state),
        }
    }

    async fn fail(&mut self, notice: Option<Notice>) {
        self.set_state(CallState::Failed);
        if let Some(notice) = notice {
            self.notify(notice);
        }
        self.teardown().await;
    }

    /// The only way back to `Idle`. Idempotent.
    async fn teardown(&mut self) {
        self.timers.cancel_all();
        self.round += 1;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        self.media.release();
        self.local_tx.send_replace(None);
        self.remote_tx.send_replace(None);
        self.ice.clear();
        self.pending = None;
        self.restart_attempted = false;
        self.restart_pending = false;
        self.session = None;
        self.set_state(CallState::Idle);
    }
}
