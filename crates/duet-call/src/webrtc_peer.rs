//! webrtc-rs backed [`PeerConnection`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use duet_common::config::IceServer;
use duet_common::{sdp_ice_ufrag, IceCandidate, SdpType, SessionDescription};

use crate::error::PeerError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{IceConnectionState, PeerConnection, PeerEvent, PeerEventSender, PeerFactory};

/// Builds webrtc-rs peers sharing one API instance and ICE configuration.
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |c| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => tx.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("ICE connection state: {}", state);
                if let Some(state) = map_ice_state(state) {
                    tx.emit(PeerEvent::IceState(state));
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                        return;
                    };
                    let stream_id = track.stream_id();
                    let stream_id = (!stream_id.is_empty()).then_some(stream_id);
                    info!("remote {} track {} arrived", kind, track.id());
                    tx.emit(PeerEvent::RemoteTrack {
                        track: RemoteTrack::new(track.id(), kind).with_handle(track),
                        stream_id,
                    });
                })
            },
        ));

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let sdp = description.sdp.clone();
    let rtc = match description.sdp_type {
        Some(SdpType::Offer) | None => RTCSessionDescription::offer(sdp)?,
        Some(SdpType::Answer) => RTCSessionDescription::answer(sdp)?,
        Some(SdpType::Pranswer) => RTCSessionDescription::pranswer(sdp)?,
        Some(SdpType::Rollback) => {
            return Err(PeerError::backend("rollback descriptions are not supported"))
        }
    };
    Ok(rtc)
}

fn from_rtc(rtc: RTCSessionDescription) -> SessionDescription {
    match rtc.sdp_type {
        RTCSdpType::Answer | RTCSdpType::Pranswer => SessionDescription::answer(rtc.sdp),
        _ => SessionDescription::offer(rtc.sdp),
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    async fn offer(&self, options: Option<RTCOfferOptions>) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(from_rtc(offer))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.pc
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        // add_track fills the first unused transceiver of a matching kind
        // negotiated by the remote offer before creating a new one.
        self.add_track(track).await
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.offer(None).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(from_rtc(answer))
    }

    async fn restart_ice(&self) -> Result<SessionDescription, PeerError> {
        self.offer(Some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        }))
        .await
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        if candidate.candidate.trim().is_empty() {
            debug!("end-of-candidates marker ignored");
            return Ok(());
        }
        if let (Some(ufrag), Some(remote)) =
            (candidate.ufrag(), self.pc.remote_description().await)
        {
            if sdp_ice_ufrag(&remote.sdp).is_some_and(|current| current != ufrag) {
                return Err(PeerError::StaleCandidate);
            }
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("peer close: {}", e);
        }
    }
}
