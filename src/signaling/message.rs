use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProctorError, Result};

/// Event name every signaling envelope is broadcast under.
pub const SIGNAL_EVENT: &str = "webrtc-signal";

/// Topic a quiz's signaling traffic is relayed on.
pub fn topic_for(quiz_id: &str) -> String {
    format!("quiz:{}", quiz_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Browser-compatible `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// One relayed connection-setup message, addressed to a single receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sender: String,
    pub receiver: String,
    pub quiz_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn new(
        kind: SignalKind,
        quiz_id: &str,
        sender: &str,
        receiver: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            quiz_id: quiz_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn description(
        quiz_id: &str,
        sender: &str,
        receiver: &str,
        description: &SessionDescription,
    ) -> Result<Self> {
        let kind = match description.kind {
            SdpKind::Offer => SignalKind::Offer,
            SdpKind::Answer => SignalKind::Answer,
        };
        Ok(Self::new(kind, quiz_id, sender, receiver, serde_json::to_value(description)?))
    }

    pub fn ice_candidate(
        quiz_id: &str,
        sender: &str,
        receiver: &str,
        candidate: &IceCandidate,
    ) -> Result<Self> {
        Ok(Self::new(
            SignalKind::IceCandidate,
            quiz_id,
            sender,
            receiver,
            serde_json::to_value(candidate)?,
        ))
    }

    pub fn is_for(&self, peer_id: &str) -> bool {
        self.receiver == peer_id
    }

    /// Decodes the payload of an offer or answer.
    pub fn session_description(&self) -> Result<SessionDescription> {
        let expected = match self.kind {
            SignalKind::Offer => SdpKind::Offer,
            SignalKind::Answer => SdpKind::Answer,
            SignalKind::IceCandidate => {
                return Err(ProctorError::InvalidSignalingMessage(
                    "ice-candidate carries no session description".to_string(),
                ))
            }
        };

        let description: SessionDescription = serde_json::from_value(self.payload.clone())
            .map_err(|e| ProctorError::InvalidSignalingMessage(format!("bad description payload: {}", e)))?;

        if description.kind != expected {
            return Err(ProctorError::InvalidSignalingMessage(format!(
                "{:?} message carries a {:?} description",
                self.kind, description.kind
            )));
        }
        Ok(description)
    }

    pub fn ice_candidate_payload(&self) -> Result<IceCandidate> {
        if self.kind != SignalKind::IceCandidate {
            return Err(ProctorError::InvalidSignalingMessage(format!(
                "{:?} message carries no ICE candidate",
                self.kind
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProctorError::InvalidSignalingMessage(format!("bad candidate payload: {}", e)))
    }
}

/// Wire envelope used by the relay: `{"event": "webrtc-signal", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub event: String,
    pub payload: SignalingMessage,
}

impl SignalEnvelope {
    pub fn wrap(payload: SignalingMessage) -> Self {
        Self {
            event: SIGNAL_EVENT.to_string(),
            payload,
        }
    }

    pub fn into_message(self) -> Result<SignalingMessage> {
        if self.event != SIGNAL_EVENT {
            return Err(ProctorError::InvalidSignalingMessage(format!(
                "unexpected event {}",
                self.event
            )));
        }
        Ok(self.payload)
    }
}
