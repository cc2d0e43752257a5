//! Local capture tracks and remote stream assembly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use duet_common::CallType;

use crate::error::DeviceError;

/// Opus frame carrying 20ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            Self::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            Self::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }

    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("microphone"),
            Self::Video => f.write_str("camera"),
        }
    }
}

struct LocalTrackInner {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

/// A local capture track. Clones share the same device; `stop` releases it
/// for every clone.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        let rtp = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                kind,
                live: AtomicBool::new(true),
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Release the device. Idempotent.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            debug!("stopped local {} track {}", self.inner.kind, self.inner.id);
        }
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    /// Push one encoded media sample. Fails once the track is stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), DeviceError> {
        if !self.is_live() {
            return Err(DeviceError::Failed {
                kind: self.kind(),
                reason: "track stopped".into(),
            });
        }
        self.inner
            .rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| DeviceError::Failed {
                kind: self.kind(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A track received from the remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: Arc<TrackRemote>) -> Self {
        self.handle = Some(handle);
        self
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
    /// True when the peer sent tracks without a stream and one was assembled here.
    pub synthesized: bool,
}

impl RemoteStream {
    fn new(id: String, synthesized: bool) -> Self {
        Self {
            id,
            tracks: Vec::new(),
            synthesized,
        }
    }

    /// Add a track, ignoring duplicates and replacing a track of the same kind.
    fn insert(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.retain(|t| t.kind != track.kind);
        self.tracks.push(track);
        true
    }

    pub fn track(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Source of local capture tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, kind: TrackKind, stream_id: &str) -> Result<LocalTrack, DeviceError>;
}

/// Devices backed by webrtc-rs sample tracks with no capture hardware.
///
/// The microphone can emit Opus silence so the remote side sees a live
/// audio track; video tracks carry no frames.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    microphone: bool,
    camera: bool,
    emit_silence: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            emit_silence: false,
        }
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, available: bool) -> Self {
        self.camera = available;
        self
    }

    pub fn with_microphone(mut self, available: bool) -> Self {
        self.microphone = available;
        self
    }

    pub fn with_silence(mut self, emit: bool) -> Self {
        self.emit_silence = emit;
        self
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kind: TrackKind, stream_id: &str) -> Result<LocalTrack, DeviceError> {
        let available = match kind {
            TrackKind::Audio => self.microphone,
            TrackKind::Video => self.camera,
        };
        if !available {
            return Err(DeviceError::NotFound(kind));
        }
        let track = LocalTrack::new(kind, stream_id);
        if kind == TrackKind::Audio && self.emit_silence {
            tokio::spawn(emit_silence(track.clone()));
        }
        Ok(track)
    }
}

async fn emit_silence(track: LocalTrack) {
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    let frame = Bytes::from_static(&OPUS_SILENCE);
    while track.is_live() {
        ticker.tick().await;
        if let Err(e) = track.write_sample(frame.clone(), AUDIO_FRAME).await {
            trace!("silence writer stopping: {}", e);
            break;
        }
    }
}

/// Result of acquiring local media for a call.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub stream: LocalStream,
    /// What the stream actually carries.
    pub call_type: CallType,
    /// Video was requested but the camera could not be opened.
    pub degraded: bool,
}

/// Owns the local capture stream and the assembled remote stream of one call.
pub struct MediaSession {
    devices: Arc<dyn MediaDevices>,
    local: Option<LocalStream>,
    remote: Option<RemoteStream>,
}

impl MediaSession {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: None,
            remote: None,
        }
    }

    /// Open the microphone, plus the camera for video calls.
    ///
    /// A camera failure degrades the call to audio-only. A microphone
    /// failure aborts and leaves nothing open.
    pub async fn acquire(&mut self, call_type: CallType) -> Result<Acquired, DeviceError> {
        self.release();
        let stream_id = Uuid::new_v4().to_string();

        let audio = match self.devices.open(TrackKind::Audio, &stream_id).await {
            Ok(track) => track,
            Err(e) => {
                warn!("microphone unavailable: {}", e);
                return Err(e);
            }
        };
        let mut tracks = vec![audio];

        let mut degraded = false;
        if call_type.wants_video() {
            match self.devices.open(TrackKind::Video, &stream_id).await {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    warn!("camera unavailable, continuing audio-only: {}", e);
                    degraded = true;
                }
            }
        }

        let stream = LocalStream {
            id: stream_id,
            tracks,
        };
        let effective = if stream.has_video() {
            CallType::Video
        } else {
            CallType::Audio
        };
        info!(
            "acquired local media: {} track(s), {}",
            stream.tracks.len(),
            effective
        );
        self.local = Some(stream.clone());
        Ok(Acquired {
            stream,
            call_type: effective,
            degraded,
        })
    }

    /// Stop every local track and forget both streams. Idempotent.
    pub fn release(&mut self) {
        if let Some(stream) = self.local.take() {
            stream.stop();
            debug!("released local stream {}", stream.id);
        }
        self.remote = None;
    }

    /// Fold a remote track into the remote stream.
    ///
    /// A track that names its stream replaces a stream with a different id.
    /// A bare track is added to a stream assembled locally.
    pub fn on_remote_track(&mut self, track: RemoteTrack, stream_id: Option<&str>) -> RemoteStream {
        let stream_id = stream_id.map(str::trim).filter(|id| !id.is_empty());
        let mut remote = match (self.remote.take(), stream_id) {
            (Some(current), Some(id)) if current.id == id => current,
            (_, Some(id)) => RemoteStream::new(id.to_string(), false),
            (Some(current), None) => current,
            (None, None) => RemoteStream::new(Uuid::new_v4().to_string(), true),
        };
        if !remote.insert(track) {
            debug!("duplicate remote track ignored");
        }
        self.remote = Some(remote.clone());
        remote
    }

    pub fn local(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&RemoteStream> {
        self.remote.as_ref()
    }
}
