use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::media::{MediaStream, MediaTrack};
use super::transport::{PeerRole, PeerTransport, TransportEvent, TransportFactory, TransportState};
use crate::error::{ProctorError, Result};
use crate::signaling::{IceCandidate, SessionDescription, SignalingChannel, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Notifications a session sends to whichever link owns it.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    RemoteStream {
        peer_id: String,
        stream: MediaStream,
    },
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub quiz_id: String,
    pub local_id: String,
    pub peer_id: String,
    pub role: PeerRole,
}

struct Status {
    state: ConnectionState,
    torn_down: bool,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
}

#[derive(Default)]
struct Negotiation {
    local_description: bool,
    remote_description: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

/// One media connection between a professor and a student.
///
/// Signaling operations are serialized through the negotiation lock, so a
/// candidate can never slip between "remote description applied" and
/// "buffer flushed".
pub struct PeerSession {
    params: SessionParams,
    transport: Arc<dyn PeerTransport>,
    channel: Arc<dyn SignalingChannel>,
    notices: Option<NoticeSender>,
    status: RwLock<Status>,
    negotiation: Mutex<Negotiation>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub async fn open(
        params: SessionParams,
        factory: &dyn TransportFactory,
        channel: Arc<dyn SignalingChannel>,
        notices: Option<NoticeSender>,
    ) -> Result<Arc<Self>> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&params.peer_id, params.role, events_tx).await?;

        tracing::info!(
            quiz_id = %params.quiz_id,
            peer_id = %params.peer_id,
            role = ?params.role,
            "Opened peer session"
        );

        let session = Arc::new(Self {
            params,
            transport,
            channel,
            notices,
            status: RwLock::new(Status {
                state: ConnectionState::New,
                torn_down: false,
                local_stream: None,
                remote_stream: None,
            }),
            negotiation: Mutex::new(Negotiation::default()),
            pump: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_transport_event(event).await;
            }
        });
        *session.pump.lock().unwrap_or_else(|p| p.into_inner()) = Some(pump);

        Ok(session)
    }

    pub fn peer_id(&self) -> &str {
        &self.params.peer_id
    }

    pub fn role(&self) -> PeerRole {
        self.params.role
    }

    pub async fn state(&self) -> ConnectionState {
        self.status.read().await.state
    }

    pub async fn remote_stream(&self) -> Option<MediaStream> {
        self.status.read().await.remote_stream.clone()
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.status.read().await.local_stream.clone()
    }

    pub async fn has_remote_description(&self) -> bool {
        self.negotiation.lock().await.remote_description
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.negotiation.lock().await.pending_candidates.len()
    }

    /// Professor side. Returns `false` without re-offering when the session
    /// is already connected or an offer is already outstanding.
    pub async fn create_offer(&self) -> Result<bool> {
        let mut negotiation = self.negotiation.lock().await;
        let state = self.ensure_open().await?;

        if state == ConnectionState::Connected || negotiation.local_description {
            tracing::debug!(peer_id = %self.params.peer_id, state = ?state, "Offer already negotiated, skipping");
            return Ok(false);
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        negotiation.local_description = true;
        self.transition(ConnectionState::Connecting).await;

        let message = SignalingMessage::description(
            &self.params.quiz_id,
            &self.params.local_id,
            &self.params.peer_id,
            &offer,
        )?;
        self.channel.publish(&self.params.quiz_id, message).await?;

        tracing::info!(peer_id = %self.params.peer_id, "Sent offer to peer");
        Ok(true)
    }

    /// Student side. Local tracks are attached before the answer is created.
    pub async fn handle_offer(
        &self,
        offer: SessionDescription,
        local_stream: Option<MediaStream>,
    ) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        self.ensure_open().await?;

        if negotiation.remote_description {
            tracing::warn!(peer_id = %self.params.peer_id, "Duplicate offer ignored");
            return Ok(());
        }

        if let Some(stream) = local_stream {
            let mut status = self.status.write().await;
            if status.torn_down {
                stream.stop_all();
                return Err(ProctorError::SessionClosed(self.params.peer_id.clone()));
            }
            status.local_stream = Some(stream.clone());
            drop(status);

            for track in stream.tracks() {
                self.transport.add_local_track(stream.id(), track).await?;
            }
        }

        self.transport.set_remote_description(offer).await?;
        negotiation.remote_description = true;
        self.transition(ConnectionState::Connecting).await;
        self.flush_pending_candidates(&mut negotiation).await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        negotiation.local_description = true;

        let message = SignalingMessage::description(
            &self.params.quiz_id,
            &self.params.local_id,
            &self.params.peer_id,
            &answer,
        )?;
        self.channel.publish(&self.params.quiz_id, message).await?;

        tracing::info!(peer_id = %self.params.peer_id, "Sent answer to peer");
        Ok(())
    }

    /// Professor side. A second answer for the same offer is ignored.
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        self.ensure_open().await?;

        if negotiation.remote_description {
            tracing::warn!(peer_id = %self.params.peer_id, "Duplicate or late answer ignored");
            return Ok(());
        }
        if !negotiation.local_description {
            return Err(ProctorError::InvalidSignalingMessage(format!(
                "answer from {} without an outstanding offer",
                self.params.peer_id
            )));
        }

        self.transport.set_remote_description(answer).await?;
        negotiation.remote_description = true;
        tracing::info!(peer_id = %self.params.peer_id, "Processed answer from peer");

        self.flush_pending_candidates(&mut negotiation).await;
        Ok(())
    }

    pub async fn handle_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        if self.status.read().await.torn_down {
            tracing::debug!(peer_id = %self.params.peer_id, "Dropping ICE candidate for closed session");
            return Ok(());
        }

        if !negotiation.remote_description {
            negotiation.pending_candidates.push_back(candidate);
            tracing::debug!(
                peer_id = %self.params.peer_id,
                queue_size = negotiation.pending_candidates.len(),
                "Queueing ICE candidate until remote description is set"
            );
            return Ok(());
        }

        self.transport.add_ice_candidate(candidate).await?;
        tracing::debug!(peer_id = %self.params.peer_id, "Added ICE candidate from peer");
        Ok(())
    }

    async fn flush_pending_candidates(&self, negotiation: &mut Negotiation) {
        if negotiation.pending_candidates.is_empty() {
            return;
        }

        tracing::info!(
            peer_id = %self.params.peer_id,
            count = negotiation.pending_candidates.len(),
            "Flushing queued ICE candidates"
        );

        while let Some(candidate) = negotiation.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::error!(
                    peer_id = %self.params.peer_id,
                    error = %e,
                    "Failed to add queued ICE candidate"
                );
            }
        }
    }

    /// Stops every owned track, closes the transport and drops buffered
    /// candidates. Safe to call any number of times.
    pub async fn close(&self) {
        let (previous, local, remote) = {
            let mut status = self.status.write().await;
            if status.torn_down {
                return;
            }
            status.torn_down = true;
            let previous = status.state;
            status.state = ConnectionState::Closed;
            (previous, status.local_stream.take(), status.remote_stream.take())
        };

        let stopped = local.map(|s| s.stop_all()).unwrap_or(0) + remote.map(|s| s.stop_all()).unwrap_or(0);

        if let Err(e) = self.transport.close().await {
            tracing::warn!(peer_id = %self.params.peer_id, error = %e, "Transport close failed");
        }

        self.negotiation.lock().await.pending_candidates.clear();

        if let Some(pump) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pump.abort();
        }

        if previous != ConnectionState::Closed {
            self.notify(SessionNotice::StateChanged {
                peer_id: self.params.peer_id.clone(),
                state: ConnectionState::Closed,
            });
        }

        tracing::info!(peer_id = %self.params.peer_id, tracks_stopped = stopped, "Peer session closed");
    }

    /// Applies one transport event. Driven by the session's event pump.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.status.read().await.torn_down {
                    return;
                }
                let message = match SignalingMessage::ice_candidate(
                    &self.params.quiz_id,
                    &self.params.local_id,
                    &self.params.peer_id,
                    &candidate,
                ) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(peer_id = %self.params.peer_id, error = %e, "Failed to encode ICE candidate");
                        return;
                    }
                };
                if let Err(e) = self.channel.publish(&self.params.quiz_id, message).await {
                    tracing::warn!(peer_id = %self.params.peer_id, error = %e, "Failed to send ICE candidate");
                }
            }
            TransportEvent::StateChanged(state) => match state {
                TransportState::Connecting => self.transition(ConnectionState::Connecting).await,
                TransportState::Connected => self.transition(ConnectionState::Connected).await,
                TransportState::Failed => self.transition(ConnectionState::Failed).await,
                TransportState::Closed => self.transition(ConnectionState::Closed).await,
                TransportState::Disconnected => {
                    tracing::debug!(peer_id = %self.params.peer_id, "Transport disconnected, waiting for recovery");
                }
                TransportState::New => {}
            },
            TransportEvent::RemoteTrack { stream_id, track } => {
                self.attach_remote_track(stream_id, track).await;
            }
        }
    }

    async fn attach_remote_track(&self, stream_id: String, track: Arc<MediaTrack>) {
        let stream = {
            let mut status = self.status.write().await;
            if status.torn_down {
                track.stop();
                return;
            }

            let mut tracks = match status.remote_stream.take() {
                Some(existing) if existing.id() == stream_id => existing.tracks().to_vec(),
                Some(previous) => {
                    previous.stop_all();
                    Vec::new()
                }
                None => Vec::new(),
            };
            tracks.push(track);

            let stream = MediaStream::new(stream_id, tracks);
            status.remote_stream = Some(stream.clone());
            stream
        };

        self.transition(ConnectionState::Connected).await;
        self.notify(SessionNotice::RemoteStream {
            peer_id: self.params.peer_id.clone(),
            stream,
        });
    }

    async fn transition(&self, next: ConnectionState) {
        let changed = {
            let mut status = self.status.write().await;
            let current = status.state;
            let allowed = match (current, next) {
                (c, n) if c == n => false,
                (c, _) if c.is_terminal() => false,
                (ConnectionState::Connected, ConnectionState::Connecting) => false,
                (_, ConnectionState::New) => false,
                _ => true,
            };
            if allowed {
                status.state = next;
            }
            allowed
        };

        if changed {
            tracing::info!(peer_id = %self.params.peer_id, state = ?next, "Peer session state changed");
            if next.is_terminal() {
                tracing::warn!(peer_id = %self.params.peer_id, state = ?next, "Connection error, retry required");
            }
            self.notify(SessionNotice::StateChanged {
                peer_id: self.params.peer_id.clone(),
                state: next,
            });
        }
    }

    async fn ensure_open(&self) -> Result<ConnectionState> {
        let status = self.status.read().await;
        if status.torn_down || status.state.is_terminal() {
            return Err(ProctorError::SessionClosed(self.params.peer_id.clone()));
        }
        Ok(status.state)
    }

    fn notify(&self, notice: SessionNotice) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::peer::media::TrackKind;
    use crate::signaling::{SignalHub, SignalKind};

    fn params(role: PeerRole) -> SessionParams {
        let (local_id, peer_id) = match role {
            PeerRole::Professor => ("prof", "student-a"),
            PeerRole::Student => ("student-a", "prof"),
        };
        SessionParams {
            quiz_id: "quiz-1".to_string(),
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            role,
        }
    }

    async fn open(
        role: PeerRole,
    ) -> (Arc<PeerSession>, Arc<ScriptedFactory>, Arc<SignalHub>, mpsc::UnboundedReceiver<SessionNotice>) {
        let factory = Arc::new(ScriptedFactory::default());
        let hub = SignalHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::open(params(role), factory.as_ref(), hub.clone(), Some(tx))
            .await
            .unwrap();
        (session, factory, hub, rx)
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_buffered_then_flushed_in_order() {
        let (session, factory, _hub, _rx) = open(PeerRole::Professor).await;
        let peer = session.peer_id().to_string();

        assert!(session.create_offer().await.unwrap());

        // Candidates race ahead of the answer.
        session.handle_ice_candidate(candidate(1)).await.unwrap();
        session.handle_ice_candidate(candidate(2)).await.unwrap();
        assert_eq!(session.pending_candidate_count().await, 2);

        let transport = factory.transport_for(&peer).unwrap();
        assert!(!transport
            .calls()
            .iter()
            .any(|c| matches!(c, Call::AddCandidate(_))));

        session.handle_answer(SessionDescription::answer("v=0 remote")).await.unwrap();
        session.handle_ice_candidate(candidate(3)).await.unwrap();

        let calls = transport.calls();
        let remote_at = calls
            .iter()
            .position(|c| *c == Call::SetRemote("v=0 remote".to_string()))
            .unwrap();
        let candidates: Vec<(usize, &Call)> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::AddCandidate(_)))
            .collect();

        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|(i, _)| *i > remote_at));
        assert_eq!(*candidates[0].1, Call::AddCandidate("candidate:1".to_string()));
        assert_eq!(*candidates[1].1, Call::AddCandidate("candidate:2".to_string()));
        assert_eq!(*candidates[2].1, Call::AddCandidate("candidate:3".to_string()));
        assert_eq!(session.pending_candidate_count().await, 0);
    }

    #[tokio::test]
    async fn test_offer_is_published_once() {
        let (session, _factory, hub, _rx) = open(PeerRole::Professor).await;
        let mut sub = hub.subscribe("quiz-1").await.unwrap();

        assert!(session.create_offer().await.unwrap());
        assert!(!session.create_offer().await.unwrap());
        assert_eq!(session.state().await, ConnectionState::Connecting);

        let message = sub.recv().await.unwrap();
        assert_eq!(message.kind, SignalKind::Offer);
        assert_eq!(message.sender, "prof");
        assert_eq!(message.receiver, "student-a");

        session.close().await;
        drop(session);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_ignored() {
        let (session, factory, _hub, _rx) = open(PeerRole::Professor).await;
        session.create_offer().await.unwrap();
        session.handle_answer(SessionDescription::answer("first")).await.unwrap();
        session.handle_answer(SessionDescription::answer("second")).await.unwrap();

        let transport = factory.transport_for("student-a").unwrap();
        let remotes: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetRemote(_)))
            .collect();
        assert_eq!(remotes, vec![Call::SetRemote("first".to_string())]);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let (session, _factory, _hub, _rx) = open(PeerRole::Professor).await;
        let result = session.handle_answer(SessionDescription::answer("early")).await;
        assert!(matches!(result, Err(ProctorError::InvalidSignalingMessage(_))));
    }

    #[tokio::test]
    async fn test_offer_attaches_tracks_before_answering() {
        let (session, factory, hub, _rx) = open(PeerRole::Student).await;
        let mut sub = hub.subscribe("quiz-1").await.unwrap();
        let local = MediaStream::new(
            "local",
            vec![MediaTrack::new("cam", TrackKind::Video), MediaTrack::new("mic", TrackKind::Audio)],
        );

        session.handle_ice_candidate(candidate(7)).await.unwrap();
        session
            .handle_offer(SessionDescription::offer("v=0 prof"), Some(local))
            .await
            .unwrap();

        let calls = factory.transport_for("prof").unwrap().calls();
        assert_eq!(
            calls,
            vec![
                Call::AddTrack("cam".to_string()),
                Call::AddTrack("mic".to_string()),
                Call::SetRemote("v=0 prof".to_string()),
                Call::AddCandidate("candidate:7".to_string()),
                Call::CreateAnswer,
                Call::SetLocal("v=0 answer".to_string()),
            ]
        );

        let answer = sub.recv().await.unwrap();
        assert_eq!(answer.kind, SignalKind::Answer);
        assert_eq!(answer.receiver, "prof");
    }

    #[tokio::test]
    async fn test_close_stops_every_track_exactly_once() {
        let (session, factory, _hub, _rx) = open(PeerRole::Student).await;
        let local = MediaStream::new("local", vec![MediaTrack::new("cam", TrackKind::Video)]);
        session
            .handle_offer(SessionDescription::offer("v=0"), Some(local.clone()))
            .await
            .unwrap();

        let remote_track = MediaTrack::new("remote-cam", TrackKind::Video);
        session
            .handle_transport_event(TransportEvent::RemoteTrack {
                stream_id: "remote".to_string(),
                track: remote_track.clone(),
            })
            .await;

        session.close().await;
        session.close().await;

        assert!(local.is_stopped());
        assert!(remote_track.is_stopped());
        // A second stop on an already stopped track reports nothing new.
        assert_eq!(local.stop_all(), 0);
        assert!(!remote_track.stop());

        let closes = factory
            .transport_for("prof")
            .unwrap()
            .calls()
            .into_iter()
            .filter(|c| *c == Call::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(session.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail_cleanly() {
        let (session, _factory, _hub, _rx) = open(PeerRole::Professor).await;
        session.close().await;

        assert!(matches!(session.create_offer().await, Err(ProctorError::SessionClosed(_))));
        // Late candidates are dropped without error.
        session.handle_ice_candidate(candidate(1)).await.unwrap();
        assert_eq!(session.pending_candidate_count().await, 0);
    }

    #[tokio::test]
    async fn test_remote_track_connects_and_notifies() {
        let (session, _factory, _hub, mut rx) = open(PeerRole::Professor).await;
        session.create_offer().await.unwrap();

        session
            .handle_transport_event(TransportEvent::RemoteTrack {
                stream_id: "s1".to_string(),
                track: MediaTrack::new("v", TrackKind::Video),
            })
            .await;
        session
            .handle_transport_event(TransportEvent::RemoteTrack {
                stream_id: "s1".to_string(),
                track: MediaTrack::new("a", TrackKind::Audio),
            })
            .await;

        assert_eq!(session.state().await, ConnectionState::Connected);
        let stream = session.remote_stream().await.unwrap();
        assert_eq!(stream.tracks().len(), 2);

        let mut saw_stream = false;
        while let Ok(notice) = rx.try_recv() {
            if let SessionNotice::RemoteStream { peer_id, .. } = notice {
                assert_eq!(peer_id, "student-a");
                saw_stream = true;
            }
        }
        assert!(saw_stream);
    }

    #[tokio::test]
    async fn test_failed_state_is_terminal() {
        let (session, _factory, _hub, _rx) = open(PeerRole::Professor).await;
        session.create_offer().await.unwrap();

        session
            .handle_transport_event(TransportEvent::StateChanged(TransportState::Failed))
            .await;
        session
            .handle_transport_event(TransportEvent::StateChanged(TransportState::Connected))
            .await;

        assert_eq!(session.state().await, ConnectionState::Failed);
        assert!(matches!(session.create_offer().await, Err(ProctorError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_failed_remote_description_keeps_candidates_buffered() {
        let factory = ScriptedFailingRemote;
        let hub = SignalHub::new();
        let session = PeerSession::open(params(PeerRole::Student), &factory, hub, None)
            .await
            .unwrap();

        session.handle_ice_candidate(candidate(1)).await.unwrap();
        let result = session.handle_offer(SessionDescription::offer("bad"), None).await;

        assert!(matches!(result, Err(ProctorError::SetRemoteDescriptionFailed(_))));
        assert!(!session.has_remote_description().await);
        assert_eq!(session.pending_candidate_count().await, 1);
    }

    struct ScriptedFailingRemote;

    #[async_trait::async_trait]
    impl TransportFactory for ScriptedFailingRemote {
        async fn create(
            &self,
            _peer_id: &str,
            _role: PeerRole,
            _events: crate::peer::transport::TransportEvents,
        ) -> Result<Arc<dyn PeerTransport>> {
            Ok(Arc::new(ScriptedTransport {
                fail_remote_description: true,
                ..Default::default()
            }))
        }
    }
}
