//! Per-identity relay connection with heartbeat, reconnect and fan-out.
//!
//! Lifecycle:
//! - `connect(identity)` opens a connection unless one is already connecting
//!   or open for the same identity. Switching identity closes the previous
//!   connection with a normal-closure code first.
//! - While open, a ping is sent every heartbeat interval. Pongs are consumed
//!   here and never reach subscribers.
//! - On a close that is neither manual nor normal (1000), and with at least
//!   one subscriber left, exactly one reconnect is scheduled after the
//!   reconnect delay. Changing identity or disconnecting cancels it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use duet_common::config::Timings;
use duet_common::{SignalMessage, SignalType, CLOSE_ABNORMAL, CLOSE_NORMAL};

use crate::transport::{Connector, Frame, Transport};

/// What subscribers observe: connectivity plus the message stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected(bool),
    Message(SignalMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

enum Outbound {
    Text(String),
    Close(u16),
}

struct Shared {
    identity: Option<String>,
    /// Bumped whenever the current connection is superseded.
    generation: u64,
    status: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reconnect: Option<JoinHandle<()>>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
    next_subscriber: u64,
}

impl Shared {
    fn broadcast(&mut self, event: &ChannelEvent) {
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }

    /// Drop the current connection without triggering reconnect logic.
    fn supersede(&mut self) {
        self.generation += 1;
        self.cancel_reconnect();
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Close(CLOSE_NORMAL));
        }
        if self.status == ConnectionState::Open {
            self.broadcast(&ChannelEvent::Connected(false));
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    timings: Timings,
    shared: Mutex<Shared>,
}

/// Handle to the relay connection of one local identity.
///
/// Cloning shares the same connection. Only the channel writes to the
/// socket; consumers issue `send` and `subscribe`.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    pub fn new(connector: Arc<dyn Connector>, timings: Timings) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                timings,
                shared: Mutex::new(Shared {
                    identity: None,
                    generation: 0,
                    status: ConnectionState::Idle,
                    outbound: None,
                    reconnect: None,
                    subscribers: HashMap::new(),
                    next_subscriber: 1,
                }),
            }),
        }
    }

    /// Open the connection for `identity`. Must run inside a tokio runtime.
    pub fn connect(&self, identity: &str) {
        let mut shared = self.inner.lock();
        let same_identity = shared.identity.as_deref() == Some(identity);
        if same_identity
            && matches!(
                shared.status,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            debug!("signaling already active for {}", identity);
            return;
        }

        if !same_identity && shared.identity.is_some() {
            info!(
                "switching signaling identity {:?} -> {}",
                shared.identity, identity
            );
        }
        shared.supersede();
        shared.identity = Some(identity.to_string());
        let generation = shared.generation;
        shared.status = ConnectionState::Connecting;
        drop(shared);

        tokio::spawn(run_connection(
            Arc::clone(&self.inner),
            identity.to_string(),
            generation,
        ));
    }

    /// Close the connection on purpose. No reconnect follows.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        if shared.identity.is_none() {
            return;
        }
        info!("disconnecting signaling for {:?}", shared.identity);
        shared.supersede();
        shared.identity = None;
        shared.status = ConnectionState::Idle;
    }

    /// Fire-and-forget send. Returns `false` when the channel is not open.
    pub fn send(&self, target_id: &str, kind: SignalType, payload: Option<Value>) -> bool {
        self.send_message(SignalMessage::new(kind).to(target_id).with_payload(payload))
    }

    pub fn send_message(&self, message: SignalMessage) -> bool {
        let shared = self.inner.lock();
        if shared.status != ConnectionState::Open {
            debug!("dropping {} while signaling is {:?}", message.kind, shared.status);
            return false;
        }
        let Some(tx) = shared.outbound.as_ref() else {
            return false;
        };
        match message.to_json() {
            Ok(text) => tx.send(Outbound::Text(text)).is_ok(),
            Err(e) => {
                warn!("failed to encode {} message: {}", message.kind, e);
                false
            }
        }
    }

    /// Register a consumer. A subscriber joining an open channel is told so
    /// immediately.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.inner.lock();
        let id = shared.next_subscriber;
        shared.next_subscriber += 1;
        if shared.status == ConnectionState::Open {
            let _ = tx.send(ChannelEvent::Connected(true));
        }
        shared.subscribers.insert(id, tx);
        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn identity(&self) -> Option<String> {
        self.inner.lock().identity.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Event stream of one consumer; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.lock().subscribers.remove(&self.id);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, text: &str) {
        let message = match SignalMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to parse signaling message: {}", e);
                return;
            }
        };
        if message.kind.is_heartbeat() {
            debug!("heartbeat {} consumed", message.kind);
            return;
        }
        self.lock().broadcast(&ChannelEvent::Message(message));
    }

    fn on_closed(self: &Arc<Self>, generation: u64, code: u16) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        let was_open = shared.status == ConnectionState::Open;
        shared.outbound = None;
        shared.status = ConnectionState::Closed;
        if was_open {
            shared.broadcast(&ChannelEvent::Connected(false));
        }

        if code == CLOSE_NORMAL {
            info!("signaling closed normally; not reconnecting");
            return;
        }
        if shared.subscribers.is_empty() {
            info!("signaling closed ({}) with no subscribers; not reconnecting", code);
            return;
        }
        if shared.reconnect.is_some() {
            return;
        }

        let delay = self.timings.reconnect_delay;
        warn!("signaling closed ({}); reconnecting in {:?}", code, delay);
        let inner = Arc::clone(self);
        shared.reconnect = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            inner.reconnect(generation);
        }));
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let mut shared = self.lock();
        shared.reconnect = None;
        if shared.generation != generation || shared.status != ConnectionState::Closed {
            return;
        }
        let Some(identity) = shared.identity.clone() else {
            return;
        };
        shared.generation += 1;
        let generation = shared.generation;
        shared.status = ConnectionState::Connecting;
        drop(shared);

        info!("reconnecting signaling for {}", identity);
        tokio::spawn(run_connection(Arc::clone(self), identity, generation));
    }
}

async fn run_connection(inner: Arc<Inner>, identity: String, generation: u64) {
    let mut transport = match inner.connector.connect(&identity).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("signaling connect for {} failed: {}", identity, e);
            inner.on_closed(generation, CLOSE_ABNORMAL);
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let superseded = {
        let mut shared = inner.lock();
        if shared.generation != generation {
            true
        } else {
            shared.status = ConnectionState::Open;
            shared.outbound = Some(tx);
            shared.broadcast(&ChannelEvent::Connected(true));
            false
        }
    };
    if superseded {
        debug!("signaling connection for {} superseded while dialing", identity);
        transport.close(CLOSE_NORMAL).await;
        return;
    }
    info!("signaling connected as {}", identity);

    let code = pump(&inner, &mut *transport, rx).await;
    debug!("signaling connection for {} ended with {}", identity, code);
    inner.on_closed(generation, code);
}

async fn pump(
    inner: &Inner,
    transport: &mut dyn Transport,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> u16 {
    let period = inner.timings.heartbeat_interval;
    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping = match SignalMessage::ping().to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode ping: {}", e);
            return CLOSE_ABNORMAL;
        }
    };

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = transport.send_text(text).await {
                        warn!("failed to send signaling message: {}", e);
                        return CLOSE_ABNORMAL;
                    }
                }
                Some(Outbound::Close(code)) => {
                    transport.close(code).await;
                    return code;
                }
                None => {
                    transport.close(CLOSE_NORMAL).await;
                    return CLOSE_NORMAL;
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = transport.send_text(ping.clone()).await {
                    warn!("failed to send heartbeat: {}", e);
                    return CLOSE_ABNORMAL;
                }
            }
            frame = transport.recv() => match frame {
                Frame::Text(text) => inner.dispatch(&text),
                Frame::Closed(code) => return code.unwrap_or(CLOSE_ABNORMAL),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Relay side of one fake connection.
    struct Remote {
        identity: String,
        inbound: mpsc::UnboundedSender<Frame>,
        sent: mpsc::UnboundedReceiver<String>,
        closed_with: Arc<Mutex<Option<u16>>>,
    }

    impl Remote {
        fn push(&self, json: &str) {
            let _ = self.inbound.send(Frame::Text(json.to_string()));
        }

        fn drop_with(&self, code: u16) {
            let _ = self.inbound.send(Frame::Closed(Some(code)));
        }

        fn closed_with(&self) -> Option<u16> {
            *self.closed_with.lock().unwrap()
        }
    }

    struct FakeTransport {
        inbound: mpsc::UnboundedReceiver<Frame>,
        sent: mpsc::UnboundedSender<String>,
        closed_with: Arc<Mutex<Option<u16>>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
            self.sent.send(text).map_err(|_| anyhow!("remote gone"))
        }

        async fn recv(&mut self) -> Frame {
            self.inbound
                .recv()
                .await
                .unwrap_or(Frame::Closed(Some(CLOSE_ABNORMAL)))
        }

        async fn close(&mut self, code: u16) {
            *self.closed_with.lock().unwrap() = Some(code);
        }
    }

    struct FakeConnector {
        attempts: AtomicUsize,
        fail: AtomicBool,
        remotes: mpsc::UnboundedSender<Remote>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, identity: &str) -> anyhow::Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("relay unreachable"));
            }
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let closed_with = Arc::new(Mutex::new(None));
            let _ = self.remotes.send(Remote {
                identity: identity.to_string(),
                inbound: inbound_tx,
                sent: sent_rx,
                closed_with: Arc::clone(&closed_with),
            });
            Ok(Box::new(FakeTransport {
                inbound: inbound_rx,
                sent: sent_tx,
                closed_with,
            }))
        }
    }

    fn setup() -> (
        SignalingChannel,
        Arc<FakeConnector>,
        mpsc::UnboundedReceiver<Remote>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            attempts: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            remotes: tx,
        });
        let channel = SignalingChannel::new(connector.clone(), Timings::default());
        (channel, connector, rx)
    }

    async fn next_event(sub: &mut Subscription) -> ChannelEvent {
        time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event timeout")
            .expect("subscription open")
    }

    async fn open(
        channel: &SignalingChannel,
        remotes: &mut mpsc::UnboundedReceiver<Remote>,
        sub: &mut Subscription,
        identity: &str,
    ) -> Remote {
        channel.connect(identity);
        let remote = remotes.recv().await.expect("remote");
        assert_eq!(next_event(sub).await, ChannelEvent::Connected(true));
        remote
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_for_same_identity() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let _remote = open(&channel, &mut remotes, &mut sub, "alice").await;

        channel.connect("alice");
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_channel() {
        let (channel, _connector, mut remotes) = setup();
        assert!(!channel.send("bob", SignalType::Offer, None));

        let mut sub = channel.subscribe();
        let mut remote = open(&channel, &mut remotes, &mut sub, "alice").await;
        assert!(channel.send(
            "bob",
            SignalType::CallEnded,
            Some(serde_json::json!({"reason": "hangup"}))
        ));
        let text = remote.sent.recv().await.expect("sent");
        let msg = SignalMessage::from_json(&text).expect("json");
        assert_eq!(msg.kind, SignalType::CallEnded);
        assert_eq!(msg.target_id.as_deref(), Some("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_and_pong_swallowed() {
        let (channel, _connector, mut remotes) = setup();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();
        let remote = open(&channel, &mut remotes, &mut first, "alice").await;
        assert_eq!(next_event(&mut second).await, ChannelEvent::Connected(true));

        remote.push(r#"{"type":"pong","timestamp":1.0}"#);
        remote.push(r#"{"type":"offer","sender_id":"bob","payload":{"sdp":"v=0"}}"#);

        for sub in [&mut first, &mut second] {
            match next_event(sub).await {
                ChannelEvent::Message(msg) => {
                    assert_eq!(msg.kind, SignalType::Offer);
                    assert_eq!(msg.sender_id.as_deref(), Some("bob"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_inbound_is_skipped() {
        let (channel, _connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let remote = open(&channel, &mut remotes, &mut sub, "alice").await;

        remote.push("{not json");
        remote.push(r#"{"type":"call-ended","sender_id":"bob"}"#);
        match next_event(&mut sub).await {
            ChannelEvent::Message(msg) => assert_eq!(msg.kind, SignalType::CallEnded),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ping_while_open() {
        let (channel, _connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let mut remote = open(&channel, &mut remotes, &mut sub, "alice").await;

        time::sleep(Duration::from_secs(21)).await;
        let text = remote.sent.recv().await.expect("ping");
        assert_eq!(text, r#"{"type":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_does_not_reconnect() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let remote = open(&channel, &mut remotes, &mut sub, "alice").await;

        remote.drop_with(CLOSE_NORMAL);
        assert_eq!(next_event(&mut sub).await, ChannelEvent::Connected(false));
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_once_after_delay() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let remote = open(&channel, &mut remotes, &mut sub, "alice").await;

        remote.drop_with(CLOSE_ABNORMAL);
        assert_eq!(next_event(&mut sub).await, ChannelEvent::Connected(false));

        time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_millis(200)).await;
        let again = remotes.recv().await.expect("reconnected");
        assert_eq!(again.identity, "alice");
        assert_eq!(next_event(&mut sub).await, ChannelEvent::Connected(true));

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_without_subscribers_stays_down() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let remote = open(&channel, &mut remotes, &mut sub, "alice").await;
        drop(sub);
        assert_eq!(channel.subscriber_count(), 0);

        remote.drop_with(CLOSE_ABNORMAL);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_closes_normally() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let remote = open(&channel, &mut remotes, &mut sub, "alice").await;

        channel.disconnect();
        assert_eq!(next_event(&mut sub).await, ChannelEvent::Connected(false));
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.closed_with(), Some(CLOSE_NORMAL));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(!channel.send("bob", SignalType::Ping, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_switch_closes_previous_connection() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let old = open(&channel, &mut remotes, &mut sub, "alice").await;

        channel.connect("carol");
        let new = remotes.recv().await.expect("new remote");
        assert_eq!(new.identity, "carol");
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(old.closed_with(), Some(CLOSE_NORMAL));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(channel.identity().as_deref(), Some("carol"));
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_switch_cancels_pending_reconnect() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        let old = open(&channel, &mut remotes, &mut sub, "alice").await;

        old.drop_with(CLOSE_ABNORMAL);
        assert_eq!(next_event(&mut sub).await, ChannelEvent::Connected(false));
        channel.connect("carol");
        let new = remotes.recv().await.expect("new remote");
        assert_eq!(new.identity, "carol");

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert!(remotes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dial_is_retried() {
        let (channel, connector, mut remotes) = setup();
        let mut sub = channel.subscribe();
        connector.fail.store(true, Ordering::SeqCst);
        channel.connect("alice");

        time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        connector.fail.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_millis(3_100)).await;
        assert!(remotes.recv().await.is_some());
        assert_eq!(next_event(&mut sub).await, ChannelEvent::Connected(true));
    }
}
