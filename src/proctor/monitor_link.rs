use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ProctorError, Result};
use crate::peer::{
    ConnectionState, MediaStream, PeerRole, PeerSession, SessionNotice, SessionParams,
    SessionRegistry, TransportFactory,
};
use crate::signaling::{SignalKind, SignalingChannel, SignalingMessage, Subscription};

/// Receives student streams as they arrive and go away.
pub trait StreamObserver: Send + Sync {
    fn on_stream(&self, student_id: &str, stream: MediaStream);

    /// The session for `student_id` was removed; drop any stream reference.
    fn on_stream_removed(&self, student_id: &str);

    /// The session failed; the UI should offer a retry.
    fn on_connection_error(&self, student_id: &str, state: ConnectionState) {
        tracing::warn!(student_id = %student_id, state = ?state, "Monitoring connection error");
    }
}

/// Professor side of monitoring: one `PeerSession` per watched student.
pub struct MonitorLink {
    quiz_id: String,
    professor_id: String,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn TransportFactory>,
    observer: Arc<dyn StreamObserver>,
    registry: Arc<SessionRegistry>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionNotice>>>,
    shutdown_tx: watch::Sender<bool>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MonitorLink {
    pub fn new(
        quiz_id: impl Into<String>,
        professor_id: impl Into<String>,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
        observer: Arc<dyn StreamObserver>,
    ) -> Arc<Self> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            quiz_id: quiz_id.into(),
            professor_id: professor_id.into(),
            channel,
            factory,
            observer,
            registry: Arc::new(SessionRegistry::new()),
            notices_tx,
            notices_rx: StdMutex::new(Some(notices_rx)),
            shutdown_tx,
            listener: StdMutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn professor_id(&self) -> &str {
        &self.professor_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn session_state(&self, student_id: &str) -> Option<ConnectionState> {
        match self.registry.get(student_id).await {
            Some(session) => Some(session.state().await),
            None => None,
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ProctorError::internal("monitor link already stopped"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let subscription = self.channel.subscribe(&self.quiz_id).await?;
        let notices = self
            .notices_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| ProctorError::internal("monitor link notices already taken"))?;

        let handle = tokio::spawn(Self::listen(
            Arc::downgrade(self),
            subscription,
            notices,
            self.shutdown_tx.subscribe(),
        ));
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        tracing::info!(quiz_id = %self.quiz_id, professor_id = %self.professor_id, "Monitor link started");
        Ok(())
    }

    async fn listen(
        link: Weak<Self>,
        mut subscription: Subscription,
        mut notices: mpsc::UnboundedReceiver<SessionNotice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = subscription.recv() => {
                    let Some(message) = message else {
                        tracing::warn!(quiz_id = %subscription.quiz_id(), "Signaling channel closed");
                        break;
                    };
                    let Some(link) = link.upgrade() else { break };
                    link.handle_signal(message).await;
                }
                Some(notice) = notices.recv() => {
                    let Some(link) = link.upgrade() else { break };
                    link.handle_notice(notice).await;
                }
            }
        }
    }

    /// Opens a session to `student_id` and sends an offer.
    ///
    /// Returns `false` without signaling when a live session already
    /// exists. A failed or closed session is torn down first.
    pub async fn request_monitor(&self, student_id: &str) -> Result<bool> {
        let session = {
            let mut sessions = self.registry.lock().await;
            if self.stopped.load(Ordering::Acquire) {
                return Err(ProctorError::internal("monitor link stopped"));
            }

            if let Some(existing) = sessions.get(student_id).cloned() {
                let state = existing.state().await;
                if !state.is_terminal() {
                    tracing::debug!(student_id = %student_id, state = ?state, "Session already active, not re-offering");
                    return Ok(false);
                }

                tracing::info!(student_id = %student_id, state = ?state, "Tearing down dead session before retry");
                sessions.remove(student_id);
                existing.close().await;
                self.observer.on_stream_removed(student_id);
            }

            let params = SessionParams {
                quiz_id: self.quiz_id.clone(),
                local_id: self.professor_id.clone(),
                peer_id: student_id.to_string(),
                role: PeerRole::Professor,
            };
            let session = PeerSession::open(
                params,
                self.factory.as_ref(),
                self.channel.clone(),
                Some(self.notices_tx.clone()),
            )
            .await?;
            sessions.insert(student_id.to_string(), session.clone());
            session
        };

        match session.create_offer().await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                tracing::error!(student_id = %student_id, error = %e, "Failed to send offer");
                self.discard(&session).await;
                Err(e)
            }
        }
    }

    /// Explicit user retry: full teardown, then a fresh offer.
    pub async fn retry(&self, student_id: &str) -> Result<bool> {
        self.stop_monitoring(student_id).await;
        self.request_monitor(student_id).await
    }

    pub async fn stop_monitoring(&self, student_id: &str) -> bool {
        let closed = self.registry.close(student_id).await;
        if closed {
            self.observer.on_stream_removed(student_id);
        }
        closed
    }

    pub async fn handle_signal(&self, message: SignalingMessage) {
        if !message.is_for(&self.professor_id) || message.sender == self.professor_id {
            return;
        }

        let Some(session) = self.registry.get(&message.sender).await else {
            tracing::debug!(sender = %message.sender, kind = ?message.kind, "No session for sender, ignoring");
            return;
        };

        let result = match message.kind {
            SignalKind::Answer => match message.session_description() {
                Ok(answer) => session.handle_answer(answer).await,
                Err(e) => Err(e),
            },
            SignalKind::IceCandidate => match message.ice_candidate_payload() {
                Ok(candidate) => session.handle_ice_candidate(candidate).await,
                Err(e) => Err(e),
            },
            SignalKind::Offer => {
                tracing::debug!(sender = %message.sender, "Professor side ignores offers");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(
                student_id = %message.sender,
                kind = ?message.kind,
                error = %e,
                "Failed to handle signaling message"
            );
        }
    }

    async fn handle_notice(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::RemoteStream { peer_id, stream } => {
                let current = self.registry.get(&peer_id).await;
                if current.is_some() {
                    tracing::info!(student_id = %peer_id, stream_id = %stream.id(), "Student stream available");
                    self.observer.on_stream(&peer_id, stream);
                }
            }
            SessionNotice::StateChanged { peer_id, state } if state.is_terminal() => {
                // Our own teardown removes the session first; only report
                // sessions that died while still registered.
                if let Some(session) = self.registry.get(&peer_id).await {
                    if session.state().await.is_terminal() {
                        self.observer.on_connection_error(&peer_id, state);
                    }
                }
            }
            SessionNotice::StateChanged { .. } => {}
        }
    }

    async fn discard(&self, session: &Arc<PeerSession>) {
        {
            let mut sessions = self.registry.lock().await;
            if sessions
                .get(session.peer_id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(session.peer_id());
            }
        }
        session.close().await;
    }

    /// Closes every session and the signaling subscription. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        for student_id in self.registry.close_all().await {
            self.observer.on_stream_removed(&student_id);
        }

        self.shutdown_tx.send_replace(true);
        let listener = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }

        tracing::info!(quiz_id = %self.quiz_id, "Monitor link stopped");
    }
}

impl Drop for MonitorLink {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.listener.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            listener.abort();
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            runtime.spawn(async move {
                registry.close_all().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::peer::session::testing::{candidate, ScriptedFactory};
    use crate::peer::{MediaTrack, TrackKind, TransportEvent, TransportState};
    use crate::signaling::{SessionDescription, SignalHub};

    #[derive(Default)]
    struct RecordingObserver {
        streams: StdMutex<Vec<String>>,
        removed: StdMutex<Vec<String>>,
        errors: StdMutex<Vec<String>>,
    }

    impl StreamObserver for RecordingObserver {
        fn on_stream(&self, student_id: &str, _stream: MediaStream) {
            self.streams.lock().unwrap().push(student_id.to_string());
        }

        fn on_stream_removed(&self, student_id: &str) {
            self.removed.lock().unwrap().push(student_id.to_string());
        }

        fn on_connection_error(&self, student_id: &str, _state: ConnectionState) {
            self.errors.lock().unwrap().push(student_id.to_string());
        }
    }

    struct Fixture {
        hub: Arc<SignalHub>,
        factory: Arc<ScriptedFactory>,
        observer: Arc<RecordingObserver>,
        link: Arc<MonitorLink>,
    }

    async fn fixture() -> Fixture {
        let hub = SignalHub::new();
        let factory = Arc::new(ScriptedFactory::default());
        let observer = Arc::new(RecordingObserver::default());
        let link = MonitorLink::new("quiz-1", "prof", hub.clone(), factory.clone(), observer.clone());
        link.start().await.unwrap();
        Fixture {
            hub,
            factory,
            observer,
            link,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_double_request_sends_one_offer() {
        let f = fixture().await;
        let mut sub = f.hub.subscribe("quiz-1").await.unwrap();

        assert!(f.link.request_monitor("student-a").await.unwrap());
        assert!(!f.link.request_monitor("student-a").await.unwrap());

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, SignalKind::Offer);
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv()).await.is_err());
        assert_eq!(f.factory.created_count(), 1);
        assert_eq!(f.link.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_replaced_on_request() {
        let f = fixture().await;
        f.link.request_monitor("student-a").await.unwrap();

        let events = f.factory.events_for("student-a").unwrap();
        events
            .send(TransportEvent::StateChanged(TransportState::Failed))
            .unwrap();
        settle().await;

        assert_eq!(f.link.session_state("student-a").await, Some(ConnectionState::Failed));
        assert_eq!(f.observer.errors.lock().unwrap().as_slice(), ["student-a"]);

        assert!(f.link.request_monitor("student-a").await.unwrap());
        assert_eq!(f.factory.created_count(), 2);
        assert_eq!(f.observer.removed.lock().unwrap().as_slice(), ["student-a"]);
        assert_eq!(f.link.session_state("student-a").await, Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn test_answer_and_candidates_are_routed() {
        let f = fixture().await;
        f.link.request_monitor("student-a").await.unwrap();

        // Candidate first, then the answer it depends on.
        let ice = SignalingMessage::ice_candidate("quiz-1", "student-a", "prof", &candidate(1)).unwrap();
        let answer = SignalingMessage::description(
            "quiz-1",
            "student-a",
            "prof",
            &SessionDescription::answer("v=0 student"),
        )
        .unwrap();
        f.hub.publish("quiz-1", ice).await.unwrap();
        f.hub.publish("quiz-1", answer).await.unwrap();
        settle().await;

        let session = f.link.registry().get("student-a").await.unwrap();
        assert!(session.has_remote_description().await);
        assert_eq!(session.pending_candidate_count().await, 0);
    }

    #[tokio::test]
    async fn test_remote_stream_reaches_observer() {
        let f = fixture().await;
        f.link.request_monitor("student-a").await.unwrap();

        f.factory
            .events_for("student-a")
            .unwrap()
            .send(TransportEvent::RemoteTrack {
                stream_id: "cam".to_string(),
                track: MediaTrack::new("v", TrackKind::Video),
            })
            .unwrap();
        settle().await;

        assert_eq!(f.observer.streams.lock().unwrap().as_slice(), ["student-a"]);
        assert_eq!(f.link.session_state("student-a").await, Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_stop_closes_sessions_and_reports_removal() {
        let f = fixture().await;
        f.link.request_monitor("student-a").await.unwrap();
        f.link.request_monitor("student-b").await.unwrap();

        f.link.stop().await;
        f.link.stop().await;

        assert!(f.link.registry().is_empty().await);
        assert_eq!(f.observer.removed.lock().unwrap().len(), 2);
        assert!(f.link.request_monitor("student-c").await.is_err());
        assert_eq!(f.hub.subscriber_count("quiz-1"), 0);
    }
}
