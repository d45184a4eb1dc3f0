use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::draft::{AttemptDraft, DraftPhase};
use super::store::{AttemptStore, AttemptSubscription, JoinOutcome};
use super::submission::{SubmissionPipeline, SubmitOutcome};
use crate::config::ProctoringConfig;
use crate::error::{ProctorError, Result};
use crate::integrity::{AlertSink, FaceDetector, FaceSample, IntegrityMonitor, WarningKind, WarningRecord};
use crate::peer::{MediaSource, MediaStream, TransportFactory};
use crate::proctor::ProctorLink;
use crate::signaling::SignalingChannel;

/// Collaborators a student-side attempt needs.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Arc<dyn AttemptStore>,
    pub channel: Arc<dyn SignalingChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub media: Arc<dyn MediaSource>,
    pub detector: Option<Arc<dyn FaceDetector>>,
    pub alerts: Arc<dyn AlertSink>,
    pub config: ProctoringConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerOutcome {
    Submitted {
        score: Option<u32>,
        auto_submitted: bool,
    },
    /// A timed or threshold submission could not be finalized. The attempt
    /// is locked and the runner keeps retrying; `Submitted` follows on
    /// success.
    SubmissionFailed { reason: String },
    /// Left without submitting; the attempt stays resumable.
    Abandoned,
}

/// One student's run through a quiz: countdown, integrity events, answer
/// saving and monitoring, all funneled into one submission guard.
pub struct QuizRunner {
    draft: Arc<AttemptDraft>,
    resumed: bool,
    store: Arc<dyn AttemptStore>,
    pipeline: Arc<SubmissionPipeline>,
    monitor: Arc<IntegrityMonitor>,
    proctor: Option<Arc<ProctorLink>>,
    deadline: Instant,
    shutdown_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<RunnerOutcome>>,
    timeline: StdMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl QuizRunner {
    /// Joins (or resumes) the quiz and starts the attempt's timeline.
    ///
    /// Fails with `AlreadySubmitted` when the student has finished this quiz.
    /// Camera failure does not fail the join: it is recorded as a warning.
    pub async fn join(quiz_id: &str, student_id: &str, deps: RunnerDeps) -> Result<Arc<Self>> {
        let outcome = deps.store.create_or_resume_attempt(quiz_id, student_id).await?;
        let (attempt, resumed) = match outcome {
            JoinOutcome::Started(attempt) => (attempt, false),
            JoinOutcome::Resumed(attempt) => (attempt, true),
            JoinOutcome::AlreadySubmitted(attempt) => {
                tracing::info!(quiz_id = %quiz_id, student_id = %student_id, "Quiz already submitted");
                return Err(ProctorError::AlreadySubmitted(attempt.id));
            }
        };

        let quiz = deps.store.fetch_quiz(quiz_id).await?;
        let draft = AttemptDraft::new(&attempt, &quiz);

        let pipeline = Arc::new(SubmissionPipeline::new(deps.store.clone(), &deps.config));
        let monitor = Arc::new(IntegrityMonitor::new(
            deps.store.clone(),
            pipeline.clone(),
            deps.alerts.clone(),
            &deps.config,
        ));
        monitor.attach(draft.clone());

        // Resuming keeps the original deadline.
        let limit = Duration::from_secs(u64::from(quiz.settings.time_limit) * 60);
        let elapsed = (Utc::now() - attempt.started_at).to_std().unwrap_or_default();
        let deadline = Instant::now() + limit.saturating_sub(elapsed);

        tracing::info!(
            quiz_id = %quiz_id,
            student_id = %student_id,
            attempt_id = %attempt.id,
            resumed = resumed,
            remaining_secs = limit.saturating_sub(elapsed).as_secs(),
            "Attempt running"
        );

        let mut camera = None;
        let mut proctor = None;
        if quiz.settings.monitoring_enabled {
            match deps.media.acquire().await {
                Ok(stream) => {
                    let link = ProctorLink::new(
                        quiz_id,
                        student_id,
                        stream.clone(),
                        deps.channel.clone(),
                        deps.store.clone(),
                        deps.transports.clone(),
                    );
                    if let Err(e) = link.start().await {
                        tracing::error!(attempt_id = %attempt.id, error = %e, "Monitoring unavailable, continuing");
                    }
                    camera = Some(stream);
                    proctor = Some(link);
                }
                Err(e) => {
                    if let Err(err) = monitor.record_media_failure(&attempt.id, &e).await {
                        tracing::error!(attempt_id = %attempt.id, error = %err, "Failed to record media failure");
                    }
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);

        let runner = Arc::new(Self {
            draft,
            resumed,
            store: deps.store.clone(),
            pipeline,
            monitor,
            proctor,
            deadline,
            shutdown_tx,
            outcome_tx,
            timeline: StdMutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let subscription = match deps.store.subscribe_to_attempts(quiz_id).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(quiz_id = %quiz_id, error = %e, "Remote submission will not be observed");
                None
            }
        };
        let sampler = match (camera, deps.detector.clone()) {
            (Some(stream), Some(detector)) => Some((stream, detector)),
            _ => None,
        };

        let handle = tokio::spawn(Self::timeline(
            Arc::downgrade(&runner),
            runner.draft.watch_phase(),
            subscription,
            sampler,
            deps.config.face_sample_interval,
            deps.config.submit_recovery_interval,
            shutdown_rx,
        ));
        *runner.timeline.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        // A media failure may already have crossed the threshold.
        if runner.draft.phase() == DraftPhase::Submitted {
            runner.finish().await;
        }

        Ok(runner)
    }

    async fn timeline(
        runner: Weak<Self>,
        mut phase: watch::Receiver<DraftPhase>,
        mut subscription: Option<AttemptSubscription>,
        sampler: Option<(MediaStream, Arc<dyn FaceDetector>)>,
        sample_interval: Duration,
        recovery_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let timer = tokio::time::sleep(Duration::ZERO);
        let recovery = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timer, recovery);
        let mut timer_fired = false;
        let mut recovering = false;

        let deadline = match runner.upgrade() {
            Some(runner) => {
                // A media failure during join may already have parked a submission.
                if *phase.borrow_and_update() == DraftPhase::Failed {
                    runner.report_failure();
                    recovery.as_mut().reset(Instant::now() + recovery_interval);
                    recovering = true;
                }
                runner.deadline
            }
            None => return,
        };
        timer.as_mut().reset(deadline);

        let mut ticker = tokio::time::interval_at(Instant::now() + sample_interval, sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = &mut timer, if !timer_fired => {
                    timer_fired = true;
                    let Some(runner) = runner.upgrade() else { break };
                    tracing::info!(attempt_id = %runner.attempt_id(), "Time limit reached, submitting");
                    if let Err(e) = runner.pipeline.submit(&runner.draft, true).await {
                        tracing::error!(attempt_id = %runner.attempt_id(), error = %e, "Timed submission failed");
                    }
                }
                _ = &mut recovery, if recovering => {
                    recovering = false;
                    let Some(runner) = runner.upgrade() else { break };
                    tracing::info!(attempt_id = %runner.attempt_id(), "Retrying parked submission");
                    if let Err(e) = runner.pipeline.retry(&runner.draft).await {
                        tracing::error!(attempt_id = %runner.attempt_id(), error = %e, "Submission retry failed");
                    }
                }
                changed = phase.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *phase.borrow_and_update();
                    match current {
                        DraftPhase::Submitted => {
                            if let Some(runner) = runner.upgrade() {
                                runner.finish().await;
                            }
                            break;
                        }
                        DraftPhase::Failed => {
                            let Some(runner) = runner.upgrade() else { break };
                            runner.report_failure();
                            recovery.as_mut().reset(Instant::now() + recovery_interval);
                            recovering = true;
                        }
                        DraftPhase::Open if timer_fired => {
                            // A manual submission that claimed the draft past the deadline was refused.
                            timer_fired = false;
                            timer.as_mut().reset(deadline);
                        }
                        _ => {}
                    }
                }
                change = next_change(&mut subscription) => {
                    let Some(change) = change else {
                        subscription = None;
                        continue;
                    };
                    let Some(runner) = runner.upgrade() else { break };
                    if change.attempt.id == runner.attempt_id() && change.attempt.is_submitted() {
                        if runner.draft.phase() != DraftPhase::Submitted {
                            tracing::warn!(attempt_id = %runner.attempt_id(), "Attempt submitted remotely");
                        }
                        runner.draft.mark_submitted_remotely(&change.attempt);
                    }
                }
                _ = ticker.tick(), if sampler.is_some() => {
                    let Some((stream, detector)) = sampler.as_ref() else { continue };
                    let Some(runner) = runner.upgrade() else { break };
                    match detector.detect(stream).await {
                        Ok(sample) => {
                            if let Err(e) = runner.on_face_sample(sample).await {
                                tracing::debug!(attempt_id = %runner.attempt_id(), error = %e, "Face sample not recorded");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(attempt_id = %runner.attempt_id(), error = %e, "Face detection failed");
                        }
                    }
                }
            }
        }
    }

    pub fn attempt_id(&self) -> &str {
        self.draft.attempt_id()
    }

    pub fn draft(&self) -> &Arc<AttemptDraft> {
        &self.draft
    }

    pub fn monitor(&self) -> &Arc<IntegrityMonitor> {
        &self.monitor
    }

    pub fn proctor_link(&self) -> Option<&Arc<ProctorLink>> {
        self.proctor.as_ref()
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn outcome(&self) -> watch::Receiver<Option<RunnerOutcome>> {
        self.outcome_tx.subscribe()
    }

    /// Records a click and saves the answers. Save failures are logged.
    /// Refused once the time limit has passed.
    pub async fn update_answer(&self, question_id: &str, option: usize, checked: bool) -> Result<()> {
        if self.remaining().is_zero() {
            return Err(ProctorError::AttemptClosed(self.attempt_id().to_string()));
        }
        let answers = self.draft.set_answer(question_id, option, checked)?;
        if let Err(e) = self.store.update_answers(self.attempt_id(), &answers).await {
            tracing::warn!(attempt_id = %self.attempt_id(), error = %e, "Failed to save answers");
        }
        Ok(())
    }

    /// The quiz tab became hidden.
    pub async fn on_visibility_hidden(&self) -> Result<Option<WarningRecord>> {
        self.record(WarningKind::TabSwitch).await
    }

    /// The quiz window lost focus.
    pub async fn on_window_blur(&self) -> Result<Option<WarningRecord>> {
        self.record(WarningKind::FocusLoss).await
    }

    pub async fn on_face_sample(&self, sample: FaceSample) -> Result<Option<WarningRecord>> {
        if !self.draft.settings().monitoring_enabled {
            return Ok(None);
        }
        self.monitor.record_face_sample(self.attempt_id(), sample).await
    }

    async fn record(&self, kind: WarningKind) -> Result<Option<WarningRecord>> {
        if !self.draft.settings().monitoring_enabled {
            return Ok(None);
        }
        self.monitor.record_warning(self.attempt_id(), kind, None).await.map(Some)
    }

    /// Student pressed submit.
    pub async fn submit(&self) -> Result<SubmitOutcome> {
        self.pipeline.submit(&self.draft, false).await
    }

    /// Waits until the attempt is submitted, its automatic submission fails,
    /// or the runner is stopped. After `SubmissionFailed` the attempt is still
    /// being retried; watch `outcome()` for the final result.
    pub async fn finished(&self) -> RunnerOutcome {
        let mut outcome = self.outcome_tx.subscribe();
        loop {
            if let Some(outcome) = outcome.borrow_and_update().clone() {
                return outcome;
            }
            if outcome.changed().await.is_err() {
                return RunnerOutcome::Abandoned;
            }
        }
    }

    fn report_failure(&self) {
        let reason = self
            .draft
            .failure()
            .unwrap_or_else(|| "submission was refused".to_string());
        tracing::error!(attempt_id = %self.attempt_id(), reason = %reason, "Attempt locked until submission succeeds");
        self.outcome_tx
            .send_replace(Some(RunnerOutcome::SubmissionFailed { reason }));
    }

    async fn finish(&self) {
        let outcome = RunnerOutcome::Submitted {
            score: self.draft.score(),
            auto_submitted: self.draft.auto_submitted(),
        };
        tracing::info!(attempt_id = %self.attempt_id(), outcome = ?outcome, "Attempt finished");
        self.release(outcome).await;
    }

    /// Leaves the attempt (navigation away). Releases monitoring; the
    /// attempt can be resumed later.
    pub async fn stop(&self) {
        self.release(RunnerOutcome::Abandoned).await;
    }

    async fn release(&self, outcome: RunnerOutcome) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(proctor) = &self.proctor {
            proctor.stop().await;
        }
        self.monitor.detach(self.attempt_id());
        self.shutdown_tx.send_replace(true);
        self.outcome_tx.send_replace(Some(outcome));
    }
}

impl Drop for QuizRunner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(timeline) = self.timeline.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            timeline.abort();
        }
    }
}

async fn next_change(subscription: &mut Option<AttemptSubscription>) -> Option<super::store::AttemptChange> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::attempt::{
        AnswerMap, Attempt, InMemoryAttemptStore, Question, QuestionKind, Quiz, QuizSettings, Submission,
    };
    use crate::integrity::{TracingAlertSink, Warning};
    use crate::peer::session::testing::ScriptedFactory;
    use crate::peer::{MediaTrack, TrackKind};
    use crate::signaling::SignalHub;

    struct Camera {
        deny: bool,
        stream: MediaStream,
    }

    #[async_trait]
    impl MediaSource for Camera {
        async fn acquire(&self) -> Result<MediaStream> {
            if self.deny {
                return Err(ProctorError::MediaPermissionDenied("NotAllowedError".to_string()));
            }
            Ok(self.stream.clone())
        }
    }

    fn quiz(settings: QuizSettings) -> Quiz {
        Quiz {
            id: "quiz-1".to_string(),
            title: "Quiz".to_string(),
            description: String::new(),
            settings,
            questions: vec![
                Question {
                    id: "q1".to_string(),
                    text: "Capital of France".to_string(),
                    kind: QuestionKind::SingleChoice,
                    options: vec!["Paris".into(), "Rome".into()],
                    correct_answers: vec![0],
                    points: 1,
                },
                Question {
                    id: "q2".to_string(),
                    text: "Even numbers".to_string(),
                    kind: QuestionKind::MultipleChoice,
                    options: vec!["2".into(), "3".into(), "4".into()],
                    correct_answers: vec![0, 2],
                    points: 1,
                },
            ],
            is_active: true,
        }
    }

    /// In-memory store whose finalize can be refused or held open.
    struct ControlledStore {
        inner: InMemoryAttemptStore,
        refuse_finalize: AtomicBool,
        hold_finalize: AtomicBool,
        release: Notify,
        finalize_calls: AtomicU32,
    }

    impl ControlledStore {
        fn new(settings: QuizSettings) -> Arc<Self> {
            let inner = InMemoryAttemptStore::new();
            inner.insert_quiz(quiz(settings)).unwrap();
            Arc::new(Self {
                inner,
                refuse_finalize: AtomicBool::new(false),
                hold_finalize: AtomicBool::new(false),
                release: Notify::new(),
                finalize_calls: AtomicU32::new(0),
            })
        }

        fn finalize_calls(&self) -> u32 {
            self.finalize_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AttemptStore for ControlledStore {
        async fn fetch_quiz(&self, quiz_id: &str) -> Result<Quiz> {
            self.inner.fetch_quiz(quiz_id).await
        }
        async fn create_or_resume_attempt(&self, quiz_id: &str, student_id: &str) -> Result<JoinOutcome> {
            self.inner.create_or_resume_attempt(quiz_id, student_id).await
        }
        async fn fetch_attempt(&self, attempt_id: &str) -> Result<Attempt> {
            self.inner.fetch_attempt(attempt_id).await
        }
        async fn update_answers(&self, attempt_id: &str, answers: &AnswerMap) -> Result<()> {
            self.inner.update_answers(attempt_id, answers).await
        }
        async fn append_warning(&self, attempt_id: &str, warning: &Warning) -> Result<()> {
            self.inner.append_warning(attempt_id, warning).await
        }
        async fn finalize_attempt(&self, attempt_id: &str, submission: Submission) -> Result<Attempt> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            if self.hold_finalize.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            if self.refuse_finalize.load(Ordering::SeqCst) {
                return Err(ProctorError::store("database unavailable"));
            }
            self.inner.finalize_attempt(attempt_id, submission).await
        }
        async fn force_submit(&self, attempt_id: &str) -> Result<Attempt> {
            self.inner.force_submit(attempt_id).await
        }
        async fn force_submit_all(&self, quiz_id: &str) -> Result<usize> {
            self.inner.force_submit_all(quiz_id).await
        }
        async fn list_attempts(&self, quiz_id: &str) -> Result<Vec<Attempt>> {
            self.inner.list_attempts(quiz_id).await
        }
        async fn subscribe_to_attempts(&self, quiz_id: &str) -> Result<AttemptSubscription> {
            self.inner.subscribe_to_attempts(quiz_id).await
        }
        async fn set_monitoring_available(&self, quiz_id: &str, student_id: &str, available: bool) -> Result<()> {
            self.inner.set_monitoring_available(quiz_id, student_id, available).await
        }
        async fn set_quiz_active(&self, quiz_id: &str, active: bool) -> Result<()> {
            self.inner.set_quiz_active(quiz_id, active).await
        }
    }

    fn recovery_config() -> ProctoringConfig {
        ProctoringConfig {
            submit_retry_attempts: 1,
            submit_recovery_interval: Duration::from_secs(120),
            ..Default::default()
        }
    }

    fn deps(store: Arc<dyn AttemptStore>, deny_camera: bool) -> (RunnerDeps, MediaStream) {
        let stream = MediaStream::new("camera", vec![MediaTrack::new("cam", TrackKind::Video)]);
        let deps = RunnerDeps {
            store,
            channel: SignalHub::new(),
            transports: Arc::new(ScriptedFactory::default()),
            media: Arc::new(Camera {
                deny: deny_camera,
                stream: stream.clone(),
            }),
            detector: None,
            alerts: Arc::new(TracingAlertSink),
            config: ProctoringConfig::default(),
        };
        (deps, stream)
    }

    fn store(settings: QuizSettings) -> Arc<InMemoryAttemptStore> {
        let store = Arc::new(InMemoryAttemptStore::new());
        store.insert_quiz(quiz(settings)).unwrap();
        store
    }

    #[tokio::test]
    async fn test_manual_submit_scores_and_releases_camera() {
        let store = store(QuizSettings::default());
        let (deps, camera) = deps(store.clone(), false);
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        runner.update_answer("q1", 0, true).await.unwrap();
        runner.update_answer("q2", 0, true).await.unwrap();
        runner.update_answer("q2", 2, true).await.unwrap();

        let outcome = runner.submit().await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Submitted {
                score: 100,
                auto_submitted: false
            }
        );

        let finished = tokio::time::timeout(Duration::from_secs(1), runner.finished()).await.unwrap();
        assert_eq!(
            finished,
            RunnerOutcome::Submitted {
                score: Some(100),
                auto_submitted: false
            }
        );
        assert!(camera.is_stopped());
        assert!(matches!(
            runner.update_answer("q1", 1, true).await,
            Err(ProctorError::AttemptClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_camera_denied_records_warning_and_continues() {
        let store = store(QuizSettings::default());
        let (deps, _) = deps(store.clone(), true);

        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        assert!(runner.proctor_link().is_none());
        assert_eq!(runner.draft().phase(), DraftPhase::Open);
        let stored = store.fetch_attempt(runner.attempt_id()).await.unwrap();
        assert_eq!(stored.warnings.len(), 1);
        assert_eq!(stored.warnings[0].kind, WarningKind::NoFace);
        assert_eq!(stored.warnings[0].description, "Camera access failed");
        runner.update_answer("q1", 0, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_camera_denied_with_single_allowed_warning_submits() {
        let store = store(QuizSettings {
            allowed_warnings: 1,
            ..Default::default()
        });
        let (deps, _) = deps(store.clone(), true);

        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        assert_eq!(runner.draft().phase(), DraftPhase::Submitted);
        let stored = store.fetch_attempt(runner.attempt_id()).await.unwrap();
        assert!(stored.auto_submitted);
    }

    #[tokio::test]
    async fn test_rejoin_resumes_same_attempt() {
        let store = store(QuizSettings::default());
        let (first_deps, _) = deps(store.clone(), false);
        let first = QuizRunner::join("quiz-1", "s1", first_deps).await.unwrap();
        first.update_answer("q1", 0, true).await.unwrap();
        let id = first.attempt_id().to_string();
        first.stop().await;

        let (second_deps, _) = deps(store.clone(), false);
        let second = QuizRunner::join("quiz-1", "s1", second_deps).await.unwrap();

        assert!(second.is_resumed());
        assert_eq!(second.attempt_id(), id);
        assert_eq!(second.draft().answers()["q1"], vec![0]);
    }

    #[tokio::test]
    async fn test_join_after_submit_fails() {
        let store = store(QuizSettings::default());
        let (deps_a, _) = deps(store.clone(), false);
        let runner = QuizRunner::join("quiz-1", "s1", deps_a).await.unwrap();
        runner.submit().await.unwrap();

        let (deps_b, _) = deps(store.clone(), false);
        let again = QuizRunner::join("quiz-1", "s1", deps_b).await;
        assert!(matches!(again, Err(ProctorError::AlreadySubmitted(_))));
    }

    #[tokio::test]
    async fn test_remote_force_submit_stops_local_mutation() {
        let store = store(QuizSettings::default());
        let (deps, camera) = deps(store.clone(), false);
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        store.force_submit(runner.attempt_id()).await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(1), runner.finished()).await.unwrap();

        assert!(matches!(finished, RunnerOutcome::Submitted { auto_submitted: true, .. }));
        assert!(camera.is_stopped());
        assert!(runner.on_window_blur().await.is_err());
        assert_eq!(runner.submit().await.unwrap(), SubmitOutcome::AlreadySubmitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_auto_submits() {
        let store = store(QuizSettings {
            time_limit: 1,
            ..Default::default()
        });
        let (deps, _) = deps(store.clone(), false);
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        let finished = runner.finished().await;

        assert!(matches!(finished, RunnerOutcome::Submitted { auto_submitted: true, .. }));
        assert!(store.fetch_attempt(runner.attempt_id()).await.unwrap().submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_monitoring_disabled_ignores_events() {
        let store = store(QuizSettings {
            monitoring_enabled: false,
            ..Default::default()
        });
        let (deps, camera) = deps(store.clone(), false);
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        assert!(runner.on_visibility_hidden().await.unwrap().is_none());
        assert!(runner.proctor_link().is_none());
        assert!(!camera.is_stopped());
        assert_eq!(runner.draft().warning_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_timed_submission_locks_attempt_and_recovers() {
        let store = ControlledStore::new(QuizSettings {
            time_limit: 1,
            ..Default::default()
        });
        store.refuse_finalize.store(true, Ordering::SeqCst);
        let (mut deps, _) = deps(store.clone(), false);
        deps.config = recovery_config();
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();
        runner.update_answer("q1", 0, true).await.unwrap();

        tokio::time::sleep(Duration::from_secs(90)).await;

        assert_eq!(runner.draft().phase(), DraftPhase::Failed);
        assert_eq!(runner.remaining(), Duration::ZERO);
        assert!(matches!(
            runner.finished().await,
            RunnerOutcome::SubmissionFailed { .. }
        ));
        assert!(matches!(
            runner.update_answer("q1", 1, true).await,
            Err(ProctorError::AttemptClosed(_))
        ));
        assert_eq!(runner.submit().await.unwrap(), SubmitOutcome::AlreadySubmitted);
        assert_eq!(store.finalize_calls(), 1);

        store.refuse_finalize.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(
            *runner.outcome().borrow(),
            Some(RunnerOutcome::Submitted {
                score: Some(50),
                auto_submitted: true
            })
        );
        let stored = store.fetch_attempt(runner.attempt_id()).await.unwrap();
        assert!(stored.submitted_at.is_some());
        assert_eq!(stored.answers["q1"], vec![0]);
        assert_eq!(store.finalize_calls(), 2);
    }

    #[tokio::test]
    async fn test_refused_threshold_submission_blocks_further_edits() {
        let store = ControlledStore::new(QuizSettings {
            allowed_warnings: 1,
            ..Default::default()
        });
        store.refuse_finalize.store(true, Ordering::SeqCst);
        let (mut deps, _) = deps(store.clone(), false);
        deps.config = recovery_config();
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        let crossed = runner.on_window_blur().await;

        assert!(matches!(crossed, Err(ProctorError::SubmissionFailed { .. })));
        assert_eq!(runner.draft().phase(), DraftPhase::Failed);
        assert!(runner.update_answer("q1", 0, true).await.is_err());
        assert!(matches!(
            runner.on_visibility_hidden().await,
            Err(ProctorError::AttemptClosed(_))
        ));
        let finished = tokio::time::timeout(Duration::from_secs(1), runner.finished()).await.unwrap();
        assert!(matches!(finished, RunnerOutcome::SubmissionFailed { .. }));
        assert_eq!(runner.draft().warning_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_finalize_once() {
        let store = ControlledStore::new(QuizSettings {
            time_limit: 1,
            allowed_warnings: 1,
            ..Default::default()
        });
        store.hold_finalize.store(true, Ordering::SeqCst);
        let (deps, _) = deps(store.clone(), false);
        let runner = QuizRunner::join("quiz-1", "s1", deps).await.unwrap();

        let threshold = tokio::spawn({
            let runner = runner.clone();
            async move { runner.on_window_blur().await }
        });
        while store.finalize_calls() == 0 {
            tokio::task::yield_now().await;
        }

        // The deadline passes while the threshold submission is in flight.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(runner.draft().phase(), DraftPhase::Submitting);
        assert_eq!(runner.submit().await.unwrap(), SubmitOutcome::AlreadySubmitted);
        assert_eq!(store.finalize_calls(), 1);

        store.release.notify_one();
        let record = threshold.await.unwrap().unwrap().unwrap();

        assert!(matches!(
            record.submission,
            Some(SubmitOutcome::Submitted { auto_submitted: true, .. })
        ));
        let finished = runner.finished().await;
        assert!(matches!(finished, RunnerOutcome::Submitted { auto_submitted: true, .. }));
        assert_eq!(store.finalize_calls(), 1);
        let stored = store.fetch_attempt(runner.attempt_id()).await.unwrap();
        assert!(stored.auto_submitted);
        assert!(stored.submitted_at.is_some());
    }
}
