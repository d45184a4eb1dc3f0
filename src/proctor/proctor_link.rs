use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::attempt::AttemptStore;
use crate::error::{ProctorError, Result};
use crate::peer::{
    ConnectionState, MediaStream, PeerRole, PeerSession, SessionNotice, SessionParams,
    SessionRegistry, TransportFactory,
};
use crate::signaling::{SignalKind, SignalingChannel, SignalingMessage, Subscription};

/// What the student's monitoring indicator shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    /// Announced and waiting for a professor to connect.
    Available,
    Connected { professor_id: String },
    ConnectionError(String),
    Stopped,
}

/// Student side of monitoring: answers professor offers with the local
/// camera and microphone.
///
/// `stop` releases everything in a fixed order: local tracks, sessions,
/// channel subscription, then the availability flag. Dropping an unstopped
/// link runs the same release.
pub struct ProctorLink {
    quiz_id: String,
    student_id: String,
    channel: Arc<dyn SignalingChannel>,
    store: Arc<dyn AttemptStore>,
    factory: Arc<dyn TransportFactory>,
    local_stream: MediaStream,
    registry: Arc<SessionRegistry>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionNotice>>>,
    shutdown_tx: watch::Sender<bool>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    status_tx: watch::Sender<LinkStatus>,
}

impl ProctorLink {
    pub fn new(
        quiz_id: impl Into<String>,
        student_id: impl Into<String>,
        local_stream: MediaStream,
        channel: Arc<dyn SignalingChannel>,
        store: Arc<dyn AttemptStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(LinkStatus::Idle);

        Arc::new(Self {
            quiz_id: quiz_id.into(),
            student_id: student_id.into(),
            channel,
            store,
            factory,
            local_stream,
            registry: Arc::new(SessionRegistry::new()),
            notices_tx,
            notices_rx: StdMutex::new(Some(notices_rx)),
            shutdown_tx,
            listener: StdMutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            status_tx,
        })
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Announces availability and starts answering offers. A signaling
    /// failure is returned; availability failures are only logged.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_stopped() {
            return Err(ProctorError::internal("proctor link already stopped"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self
            .store
            .set_monitoring_available(&self.quiz_id, &self.student_id, true)
            .await
        {
            tracing::error!(student_id = %self.student_id, error = %e, "Failed to announce monitoring availability");
        }

        let subscription = match self.channel.subscribe(&self.quiz_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(quiz_id = %self.quiz_id, error = %e, "Failed to subscribe to signaling");
                self.status_tx.send_replace(LinkStatus::ConnectionError(e.to_string()));
                return Err(e);
            }
        };

        let notices = self
            .notices_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| ProctorError::internal("proctor link notices already taken"))?;

        let handle = tokio::spawn(Self::listen(
            Arc::downgrade(self),
            subscription,
            notices,
            self.shutdown_tx.subscribe(),
        ));
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        self.status_tx.send_replace(LinkStatus::Available);
        tracing::info!(quiz_id = %self.quiz_id, student_id = %self.student_id, "Proctor link started");
        Ok(())
    }

    async fn listen(
        link: std::sync::Weak<Self>,
        mut subscription: Subscription,
        mut notices: mpsc::UnboundedReceiver<SessionNotice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = subscription.recv() => {
                    let Some(link) = link.upgrade() else { break };
                    match message {
                        Some(message) => link.handle_signal(message).await,
                        None => {
                            tracing::warn!(quiz_id = %subscription.quiz_id(), "Signaling channel closed");
                            link.status_tx.send_replace(LinkStatus::ConnectionError("signaling channel closed".to_string()));
                            break;
                        }
                    }
                }
                Some(notice) = notices.recv() => {
                    let Some(link) = link.upgrade() else { break };
                    link.handle_notice(notice).await;
                }
            }
        }
        // Dropping the subscription unsubscribes.
        drop(subscription);
    }

    /// Routes one relayed message addressed to this student.
    pub async fn handle_signal(&self, message: SignalingMessage) {
        if !message.is_for(&self.student_id) || message.sender == self.student_id {
            return;
        }

        let result = match message.kind {
            SignalKind::Offer => self.handle_offer(&message).await,
            SignalKind::IceCandidate => self.handle_ice_candidate(&message).await,
            SignalKind::Answer => {
                tracing::debug!(sender = %message.sender, "Student side ignores answers");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(
                student_id = %self.student_id,
                sender = %message.sender,
                kind = ?message.kind,
                error = %e,
                "Failed to handle signaling message"
            );
            if !self.is_stopped() {
                self.status_tx.send_replace(LinkStatus::ConnectionError(e.to_string()));
            }
        }
    }

    async fn handle_offer(&self, message: &SignalingMessage) -> Result<()> {
        let offer = message.session_description()?;
        let professor_id = message.sender.clone();

        let session = {
            let mut sessions = self.registry.lock().await;
            if self.is_stopped() {
                return Ok(());
            }

            // A session opened for early candidates is reused; anything that
            // already negotiated is torn down before the new offer is answered.
            let existing = sessions.get(&professor_id).cloned();
            let reusable = match &existing {
                Some(existing) => {
                    !existing.state().await.is_terminal() && !existing.has_remote_description().await
                }
                None => false,
            };

            match existing {
                Some(existing) if reusable => existing,
                existing => {
                    if let Some(previous) = existing {
                        tracing::info!(professor_id = %professor_id, "Replacing session for new offer");
                        sessions.remove(&professor_id);
                        previous.close().await;
                    }
                    let session = self.open_session(&professor_id).await?;
                    sessions.insert(professor_id.clone(), session.clone());
                    session
                }
            }
        };

        if let Err(e) = session.handle_offer(offer, Some(self.local_stream.fork())).await {
            self.discard(&session).await;
            return Err(e);
        }
        Ok(())
    }

    async fn handle_ice_candidate(&self, message: &SignalingMessage) -> Result<()> {
        let candidate = message.ice_candidate_payload()?;

        let session = {
            let mut sessions = self.registry.lock().await;
            if self.is_stopped() {
                return Ok(());
            }
            match sessions.get(&message.sender) {
                Some(session) => session.clone(),
                None => {
                    // Candidate raced ahead of its offer.
                    let session = self.open_session(&message.sender).await?;
                    sessions.insert(message.sender.clone(), session.clone());
                    session
                }
            }
        };

        session.handle_ice_candidate(candidate).await
    }

    async fn open_session(&self, professor_id: &str) -> Result<Arc<PeerSession>> {
        let params = SessionParams {
            quiz_id: self.quiz_id.clone(),
            local_id: self.student_id.clone(),
            peer_id: professor_id.to_string(),
            role: PeerRole::Student,
        };
        PeerSession::open(
            params,
            self.factory.as_ref(),
            self.channel.clone(),
            Some(self.notices_tx.clone()),
        )
        .await
    }

    /// Removes `session` if it is still the registered one, then closes it.
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

    async fn handle_notice(&self, notice: SessionNotice) {
        if self.is_stopped() {
            return;
        }
        match notice {
            SessionNotice::StateChanged { peer_id, state } => match state {
                ConnectionState::Connected => {
                    self.status_tx.send_replace(LinkStatus::Connected { professor_id: peer_id });
                }
                ConnectionState::Failed | ConnectionState::Closed => {
                    let still_registered = self.registry.get(&peer_id).await;
                    if let Some(session) = still_registered {
                        if session.state().await.is_terminal() {
                            tracing::warn!(professor_id = %peer_id, state = ?state, "Monitoring connection lost");
                            self.discard(&session).await;
                            self.status_tx.send_replace(LinkStatus::ConnectionError(format!(
                                "connection to {} {:?}",
                                peer_id, state
                            )));
                        }
                    }
                }
                ConnectionState::New | ConnectionState::Connecting => {}
            },
            SessionNotice::RemoteStream { peer_id, .. } => {
                tracing::debug!(professor_id = %peer_id, "Ignoring remote stream on student side");
            }
        }
    }

    /// Releases every resource the link owns. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let tracks = self.local_stream.stop_all();
        let sessions = self.registry.close_all().await;

        self.shutdown_tx.send_replace(true);
        let listener = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                if !e.is_cancelled() {
                    tracing::warn!(student_id = %self.student_id, error = %e, "Signaling listener ended abnormally");
                }
            }
        }

        if self.started.load(Ordering::Acquire) {
            if let Err(e) = self
                .store
                .set_monitoring_available(&self.quiz_id, &self.student_id, false)
                .await
            {
                tracing::error!(student_id = %self.student_id, error = %e, "Failed to clear monitoring availability");
            }
        }

        self.status_tx.send_replace(LinkStatus::Stopped);
        tracing::info!(
            student_id = %self.student_id,
            tracks_stopped = tracks,
            sessions_closed = sessions.len(),
            "Proctor link stopped"
        );
    }
}

impl Drop for ProctorLink {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::warn!(student_id = %self.student_id, "Proctor link dropped without stop, releasing");
        self.local_stream.stop_all();
        if let Some(listener) = self.listener.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            listener.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        let store = self.store.clone();
        let quiz_id = self.quiz_id.clone();
        let student_id = self.student_id.clone();
        let started = self.started.load(Ordering::Acquire);
        runtime.spawn(async move {
            registry.close_all().await;
            if started {
                if let Err(e) = store.set_monitoring_available(&quiz_id, &student_id, false).await {
                    tracing::error!(student_id = %student_id, error = %e, "Failed to clear monitoring availability");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::attempt::{InMemoryAttemptStore, Quiz, QuizSettings};
    use crate::peer::session::testing::{candidate, Call, ScriptedFactory};
    use crate::peer::{MediaTrack, TrackKind};
    use crate::signaling::{SessionDescription, SignalHub};

    struct Fixture {
        hub: Arc<SignalHub>,
        store: Arc<InMemoryAttemptStore>,
        factory: Arc<ScriptedFactory>,
        camera: MediaStream,
        link: Arc<ProctorLink>,
    }

    async fn fixture() -> Fixture {
        let hub = SignalHub::new();
        let store = Arc::new(InMemoryAttemptStore::new());
        store
            .insert_quiz(Quiz {
                id: "quiz-1".to_string(),
                title: "Quiz".to_string(),
                description: String::new(),
                settings: QuizSettings::default(),
                questions: vec![],
                is_active: true,
            })
            .unwrap();
        store.create_or_resume_attempt("quiz-1", "student-a").await.unwrap();

        let factory = Arc::new(ScriptedFactory::default());
        let camera = MediaStream::new(
            "camera",
            vec![MediaTrack::new("cam", TrackKind::Video), MediaTrack::new("mic", TrackKind::Audio)],
        );
        let link = ProctorLink::new(
            "quiz-1",
            "student-a",
            camera.clone(),
            hub.clone(),
            store.clone(),
            factory.clone(),
        );
        Fixture {
            hub,
            store,
            factory,
            camera,
            link,
        }
    }

    fn offer() -> SignalingMessage {
        SignalingMessage::description("quiz-1", "prof", "student-a", &SessionDescription::offer("v=0 prof"))
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn monitoring_available(store: &InMemoryAttemptStore) -> bool {
        store.list_attempts("quiz-1").await.unwrap()[0].monitoring_available
    }

    #[tokio::test]
    async fn test_start_announces_and_answers_offer() {
        let f = fixture().await;
        f.link.start().await.unwrap();
        assert!(monitoring_available(&f.store).await);
        assert_eq!(*f.link.status().borrow(), LinkStatus::Available);

        let mut professor = f.hub.subscribe("quiz-1").await.unwrap();
        f.hub.publish("quiz-1", offer()).await.unwrap();

        let mut answer = None;
        while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(200), professor.recv()).await {
            if message.kind == SignalKind::Answer {
                answer = Some(message);
                break;
            }
        }
        let answer = answer.unwrap();
        assert_eq!(answer.sender, "student-a");
        assert_eq!(answer.receiver, "prof");

        let calls = f.factory.transport_for("prof").unwrap().calls();
        assert!(matches!(calls[0], Call::AddTrack(_)));
        assert!(matches!(calls[1], Call::AddTrack(_)));
    }

    #[tokio::test]
    async fn test_candidate_before_offer_reuses_session() {
        let f = fixture().await;
        f.link.start().await.unwrap();

        let ice = SignalingMessage::ice_candidate("quiz-1", "prof", "student-a", &candidate(4)).unwrap();
        f.hub.publish("quiz-1", ice).await.unwrap();
        f.hub.publish("quiz-1", offer()).await.unwrap();
        settle().await;

        assert_eq!(f.factory.created_count(), 1);
        let calls = f.factory.transport_for("prof").unwrap().calls();
        let remote_at = calls.iter().position(|c| matches!(c, Call::SetRemote(_))).unwrap();
        let candidate_at = calls
            .iter()
            .position(|c| *c == Call::AddCandidate("candidate:4".to_string()))
            .unwrap();
        assert!(candidate_at > remote_at);
    }

    #[tokio::test]
    async fn test_messages_for_others_are_ignored() {
        let f = fixture().await;
        f.link.start().await.unwrap();

        let other = SignalingMessage::description("quiz-1", "prof", "student-b", &SessionDescription::offer("x"))
            .unwrap();
        f.hub.publish("quiz-1", other).await.unwrap();
        settle().await;

        assert_eq!(f.factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_releases_everything() {
        let f = fixture().await;
        f.link.start().await.unwrap();
        f.hub.publish("quiz-1", offer()).await.unwrap();
        settle().await;
        let session = f.link.registry().get("prof").await.unwrap();
        let forked = session.local_stream().await.unwrap();

        f.link.stop().await;
        f.link.stop().await;

        assert!(f.camera.is_stopped());
        assert!(forked.is_stopped());
        assert_eq!(session.state().await, ConnectionState::Closed);
        assert!(f.link.registry().is_empty().await);
        assert_eq!(f.hub.subscriber_count("quiz-1"), 0);
        assert!(!monitoring_available(&f.store).await);
        assert_eq!(*f.link.status().borrow(), LinkStatus::Stopped);
    }

    #[tokio::test]
    async fn test_drop_without_stop_releases_tracks() {
        let f = fixture().await;
        f.link.start().await.unwrap();
        let camera = f.camera.clone();
        let store = f.store.clone();

        drop(f);
        settle().await;

        assert!(camera.is_stopped());
        assert!(!monitoring_available(&store).await);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        struct DeadChannel;

        #[async_trait::async_trait]
        impl SignalingChannel for DeadChannel {
            async fn publish(&self, _quiz_id: &str, _message: SignalingMessage) -> Result<()> {
                Err(ProctorError::signaling("offline"))
            }
            async fn subscribe(&self, _quiz_id: &str) -> Result<Subscription> {
                Err(ProctorError::signaling("offline"))
            }
        }

        let f = fixture().await;
        let link = ProctorLink::new(
            "quiz-1",
            "student-a",
            f.camera.clone(),
            Arc::new(DeadChannel),
            f.store.clone(),
            f.factory.clone(),
        );

        assert!(matches!(link.start().await, Err(ProctorError::Signaling(_))));
        assert!(matches!(*link.status().borrow(), LinkStatus::ConnectionError(_)));
        link.stop().await;
        assert!(f.camera.is_stopped());
    }
}
