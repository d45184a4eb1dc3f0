use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::media::MediaTrack;
use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Professor,
    Student,
}

/// Connection state as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A locally gathered candidate that must be signaled to the remote side.
    LocalCandidate(IceCandidate),
    RemoteTrack {
        stream_id: String,
        track: Arc<MediaTrack>,
    },
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// The media connection a `PeerSession` drives. Implementations report
/// asynchronous happenings through the `TransportEvents` sender they were
/// created with.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_local_track(&self, stream_id: &str, track: &MediaTrack) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        role: PeerRole,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>>;
}
