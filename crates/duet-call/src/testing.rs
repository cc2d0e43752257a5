//! In-memory fakes for the signal, device and peer seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use duet_common::{sdp_ice_ufrag, IceCandidate, SdpType, SessionDescription, SignalMessage, SignalType};

use crate::engine::SignalSink;
use crate::error::{DeviceError, PeerError};
use crate::media::{LocalTrack, MediaDevices, TrackKind};
use crate::peer::{PeerConnection, PeerEventSender, PeerFactory};

/// Records everything the engine sends.
pub struct FakeSink {
    sent: Mutex<Vec<SignalMessage>>,
    pub open: AtomicBool,
}

impl Default for FakeSink {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }
}

impl FakeSink {
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: SignalType) -> usize {
        self.sent().iter().filter(|m| m.kind == kind).count()
    }

    pub fn last(&self, kind: SignalType) -> Option<SignalMessage> {
        self.sent().into_iter().rev().find(|m| m.kind == kind)
    }
}

impl SignalSink for FakeSink {
    fn send(&self, target_id: &str, kind: SignalType, payload: Option<Value>) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push(SignalMessage::new(kind).to(target_id).with_payload(payload));
        true
    }
}

/// Devices that count opens and keep every track they hand out.
pub struct FakeDevices {
    opens: AtomicUsize,
    pub camera: AtomicBool,
    pub microphone: AtomicBool,
    tracks: Mutex<Vec<LocalTrack>>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            camera: AtomicBool::new(true),
            microphone: AtomicBool::new(true),
            tracks: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDevices {
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks().iter().all(|t| !t.is_live())
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, kind: TrackKind, stream_id: &str) -> Result<LocalTrack, DeviceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let available = match kind {
            TrackKind::Audio => self.microphone.load(Ordering::SeqCst),
            TrackKind::Video => self.camera.load(Ordering::SeqCst),
        };
        if !available {
            return Err(DeviceError::PermissionDenied(kind));
        }
        let track = LocalTrack::new(kind, stream_id);
        self.tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

/// Peer that logs calls in order and validates candidates against the
/// remote ufrag like a real stack does.
#[derive(Default)]
pub struct FakePeer {
    calls: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    remote_ufrag: Mutex<Option<String>>,
    offers: AtomicUsize,
    closed: AtomicBool,
    pub fail_remote: AtomicBool,
}

impl FakePeer {
    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn set_remote_ufrag(&self, ufrag: &str) {
        *self.remote_ufrag.lock().unwrap() = Some(ufrag.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_offer(&self) -> SessionDescription {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        SessionDescription::offer(format!("v=0\r\na=ice-ufrag:local{n}\r\n"))
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.log(format!("add_track:{:?}", track.kind()).to_lowercase());
        Ok(())
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.log(format!("attach_track:{:?}", track.kind()).to_lowercase());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.log("create_offer");
        Ok(self.next_offer())
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.log("create_answer");
        Ok(SessionDescription::answer("v=0\r\na=ice-ufrag:answer\r\n"))
    }

    async fn restart_ice(&self) -> Result<SessionDescription, PeerError> {
        self.log("restart_ice");
        Ok(self.next_offer())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        let kind = match description.sdp_type {
            Some(SdpType::Answer) => "answer",
            _ => "offer",
        };
        self.log(format!("set_remote:{kind}"));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(PeerError::backend("unsupported description"));
        }
        if let Some(ufrag) = sdp_ice_ufrag(&description.sdp) {
            self.set_remote_ufrag(ufrag);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let current = self.remote_ufrag.lock().unwrap().clone();
        if let (Some(ufrag), Some(current)) = (candidate.ufrag(), current) {
            if ufrag != current {
                return Err(PeerError::StaleCandidate);
            }
        }
        self.applied.lock().unwrap().push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.log("close");
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakePeer`]s and keeps their event senders for injection.
#[derive(Default)]
pub struct FakeFactory {
    peers: Mutex<Vec<(Arc<FakePeer>, PeerEventSender)>>,
    /// New peers reject every remote description.
    pub fail_remote: AtomicBool,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock().unwrap()[index].0)
    }

    pub fn latest(&self) -> Arc<FakePeer> {
        let peers = self.peers.lock().unwrap();
        Arc::clone(&peers.last().expect("no peer created").0)
    }

    pub fn events(&self, index: usize) -> PeerEventSender {
        self.peers.lock().unwrap()[index].1.clone()
    }

    pub fn latest_events(&self) -> PeerEventSender {
        let peers = self.peers.lock().unwrap();
        peers.last().expect("no peer created").1.clone()
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(FakePeer::default());
        peer.fail_remote
            .store(self.fail_remote.load(Ordering::SeqCst), Ordering::SeqCst);
        self.peers
            .lock()
            .unwrap()
            .push((Arc::clone(&peer), events));
        Ok(peer)
    }
}
