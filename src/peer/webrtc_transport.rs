use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::media::{EncodedFrame, MediaTrack, TrackKind};
use super::transport::{
    PeerRole, PeerTransport, TransportEvent, TransportEvents, TransportFactory, TransportState,
};
use crate::config::WebRtcConfig;
use crate::error::{ProctorError, Result};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

const VP8_MIME: &str = "video/VP8";
const OPUS_MIME: &str = "audio/opus";

fn vp8_capability() -> RTCRtpCodecCapability {
    // RTCP feedback mechanisms for video - critical for keyframe recovery
    let rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_string(),
            parameter: "".to_string(),
        },
        RTCPFeedback {
            typ: "ccm".to_string(),
            parameter: "fir".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "pli".to_string(),
        },
    ];

    RTCRtpCodecCapability {
        mime_type: VP8_MIME.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "".to_string(),
        rtcp_feedback,
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: OPUS_MIME.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

pub fn create_webrtc_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: vp8_capability(),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    // IPv4 only avoids IPv6 binding errors on hosts without v6 routes
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    setting_engine.set_ice_multicast_dns_mode(webrtc::ice::mdns::MulticastDnsMode::Disabled);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    Ok(Arc::new(api))
}

pub fn get_ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut ice_servers = Vec::new();

    if !config.stun_servers.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }

    for turn_server in &config.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn_server.urls.clone(),
            username: turn_server.username.clone(),
            credential: turn_server.credential.clone(),
            credential_type: RTCIceCredentialType::Password,
        });
    }

    ice_servers
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| ProctorError::InvalidSdp(e.to_string()))
}

/// Creates `webrtc`-crate peer connections for proctoring sessions.
pub struct WebRtcTransportFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
            ice_servers: get_ice_servers(config),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        role: PeerRole,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| ProctorError::PeerConnectionCreation(e.to_string()))?,
        );

        // The professor only receives; the student's tracks are added on offer.
        if role == PeerRole::Professor {
            peer_connection.add_transceiver_from_kind(RTPCodecType::Video, None).await?;
            peer_connection.add_transceiver_from_kind(RTPCodecType::Audio, None).await?;
        }

        let state_events = events.clone();
        let state_peer = peer_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(peer_id = %state_peer, state = %state, "Peer connection state changed");
            let _ = state_events.send(TransportEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        let candidate_peer = peer_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => {
                        tracing::error!(peer_id = %candidate_peer, error = %e, "Failed to serialize local ICE candidate");
                    }
                }
            }
            Box::pin(async {})
        }));

        let track_events = events;
        let track_peer = peer_id.to_string();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            tracing::info!(peer_id = %track_peer, track_id = %track.id(), kind = ?kind, "Received remote track");
            let _ = track_events.send(TransportEvent::RemoteTrack {
                stream_id: track.stream_id(),
                track: MediaTrack::new(track.id(), kind),
            });
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcTransport {
            peer_id: peer_id.to_string(),
            peer_connection,
        }))
    }
}

pub struct WebRtcTransport {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| ProctorError::CreateOfferFailed(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| ProctorError::CreateAnswerFailed(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| ProctorError::AddIceCandidateFailed(e.to_string()))
    }

    async fn add_local_track(&self, stream_id: &str, track: &MediaTrack) -> Result<()> {
        let capability = match track.kind() {
            TrackKind::Video => vp8_capability(),
            TrackKind::Audio => opus_capability(),
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            stream_id.to_string(),
        ));

        self.peer_connection
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| ProctorError::AddTrackFailed(e.to_string()))?;
        tracing::debug!(peer_id = %self.peer_id, track_id = %track.id(), "Added local track");

        tokio::spawn(forward_frames(
            self.peer_id.clone(),
            track.id().to_string(),
            track.frames(),
            track.stopped(),
            local,
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tracing::info!(peer_id = %self.peer_id, "Closing peer connection");
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Writes the track's captured frames into the peer connection until the
/// track stops or its capture feed closes.
async fn forward_frames(
    peer_id: String,
    track_id: String,
    mut frames: tokio::sync::broadcast::Receiver<EncodedFrame>,
    mut stopped: tokio::sync::watch::Receiver<bool>,
    local: Arc<TrackLocalStaticSample>,
) {
    if *stopped.borrow_and_update() {
        return;
    }

    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let sample = Sample {
                        data: frame.data,
                        duration: frame.duration,
                        ..Default::default()
                    };
                    if let Err(e) = local.write_sample(&sample).await {
                        tracing::debug!(peer_id = %peer_id, track_id = %track_id, error = %e, "Sample write failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(peer_id = %peer_id, track_id = %track_id, skipped = n, "Frame feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(peer_id = %peer_id, track_id = %track_id, "Frame forwarding stopped");
}
