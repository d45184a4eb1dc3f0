use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;

use super::model::{AnswerMap, Attempt, Quiz, Submission};
use super::scoring::score_answers;
use crate::error::{ProctorError, Result};
use crate::integrity::Warning;

const CHANGE_BUFFER: usize = 256;

/// Result of joining a quiz.
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    Started(Attempt),
    /// An unsubmitted attempt already existed and is returned unchanged.
    Resumed(Attempt),
    AlreadySubmitted(Attempt),
}

impl JoinOutcome {
    pub fn attempt(&self) -> &Attempt {
        match self {
            JoinOutcome::Started(a) | JoinOutcome::Resumed(a) | JoinOutcome::AlreadySubmitted(a) => a,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptChange {
    pub kind: ChangeKind,
    pub attempt: Attempt,
}

/// Change feed for one quiz's attempts.
pub struct AttemptSubscription {
    quiz_id: String,
    receiver: broadcast::Receiver<AttemptChange>,
}

impl AttemptSubscription {
    pub fn new(quiz_id: impl Into<String>, receiver: broadcast::Receiver<AttemptChange>) -> Self {
        Self {
            quiz_id: quiz_id.into(),
            receiver,
        }
    }

    /// Next change for this quiz, or `None` once the store is gone. Missed
    /// changes are logged; the watcher's reconciliation poll covers them.
    pub async fn recv(&mut self) -> Option<AttemptChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.attempt.quiz_id == self.quiz_id => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(quiz_id = %self.quiz_id, skipped = skipped, "Attempt subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Record store for quizzes and attempts.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn fetch_quiz(&self, quiz_id: &str) -> Result<Quiz>;

    /// Never creates a second unsubmitted attempt for the same (quiz, student).
    async fn create_or_resume_attempt(&self, quiz_id: &str, student_id: &str) -> Result<JoinOutcome>;

    async fn fetch_attempt(&self, attempt_id: &str) -> Result<Attempt>;

    async fn update_answers(&self, attempt_id: &str, answers: &AnswerMap) -> Result<()>;

    async fn append_warning(&self, attempt_id: &str, warning: &Warning) -> Result<()>;

    /// Fails with `AlreadySubmitted` if the attempt was finalized before.
    async fn finalize_attempt(&self, attempt_id: &str, submission: Submission) -> Result<Attempt>;

    /// Professor-initiated submission with `autoSubmitted = true`.
    async fn force_submit(&self, attempt_id: &str) -> Result<Attempt>;

    /// Force-submits every open attempt of the quiz, returning how many.
    async fn force_submit_all(&self, quiz_id: &str) -> Result<usize>;

    async fn list_attempts(&self, quiz_id: &str) -> Result<Vec<Attempt>>;

    async fn subscribe_to_attempts(&self, quiz_id: &str) -> Result<AttemptSubscription>;

    async fn set_monitoring_available(&self, quiz_id: &str, student_id: &str, available: bool) -> Result<()>;

    async fn set_quiz_active(&self, quiz_id: &str, active: bool) -> Result<()>;
}

#[derive(Default)]
struct StoreState {
    quizzes: HashMap<String, Quiz>,
    attempts: HashMap<String, Attempt>,
}

/// Process-local `AttemptStore`, used by the relay's demo mode and tests.
pub struct InMemoryAttemptStore {
    state: Mutex<StoreState>,
    changes: broadcast::Sender<AttemptChange>,
}

impl Default for InMemoryAttemptStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            state: Mutex::new(StoreState::default()),
            changes,
        }
    }
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_quiz(&self, quiz: Quiz) -> Result<()> {
        quiz.settings.validate()?;
        tracing::info!(quiz_id = %quiz.id, questions = quiz.questions.len(), "Registered quiz");
        self.state().quizzes.insert(quiz.id.clone(), quiz);
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generate_attempt_id() -> String {
        let mut rng = rand::thread_rng();
        format!("attempt-{:012x}", rng.gen::<u64>() & 0xffff_ffff_ffff)
    }

    fn publish(&self, kind: ChangeKind, attempt: &Attempt) {
        // No receivers is fine.
        let _ = self.changes.send(AttemptChange {
            kind,
            attempt: attempt.clone(),
        });
    }

    /// Applies `f` to an unsubmitted attempt and publishes the update.
    fn mutate_open<F>(&self, attempt_id: &str, f: F) -> Result<Attempt>
    where
        F: FnOnce(&mut Attempt),
    {
        let updated = {
            let mut state = self.state();
            let attempt = state
                .attempts
                .get_mut(attempt_id)
                .ok_or_else(|| ProctorError::AttemptNotFound(attempt_id.to_string()))?;
            if attempt.is_submitted() {
                return Err(ProctorError::AlreadySubmitted(attempt_id.to_string()));
            }
            f(attempt);
            attempt.clone()
        };
        self.publish(ChangeKind::Update, &updated);
        Ok(updated)
    }

    fn force_submit_locked(state: &mut StoreState, attempt_id: &str) -> Result<Attempt> {
        let StoreState { quizzes, attempts } = state;
        let attempt = attempts
            .get_mut(attempt_id)
            .ok_or_else(|| ProctorError::AttemptNotFound(attempt_id.to_string()))?;
        if attempt.is_submitted() {
            return Err(ProctorError::AlreadySubmitted(attempt_id.to_string()));
        }

        let score = quizzes
            .get(&attempt.quiz_id)
            .map(|quiz| score_answers(&quiz.questions, &attempt.answers))
            .unwrap_or(0);
        attempt.submitted_at = Some(Utc::now());
        attempt.auto_submitted = true;
        attempt.score = Some(score);
        attempt.monitoring_available = false;
        Ok(attempt.clone())
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn fetch_quiz(&self, quiz_id: &str) -> Result<Quiz> {
        self.state()
            .quizzes
            .get(quiz_id)
            .cloned()
            .ok_or_else(|| ProctorError::store(format!("quiz {} not found", quiz_id)))
    }

    async fn create_or_resume_attempt(&self, quiz_id: &str, student_id: &str) -> Result<JoinOutcome> {
        let (outcome, inserted) = {
            let mut state = self.state();
            let active = state
                .quizzes
                .get(quiz_id)
                .map(|quiz| quiz.is_active)
                .ok_or_else(|| ProctorError::store(format!("quiz {} not found", quiz_id)))?;

            let mut existing: Vec<Attempt> = state
                .attempts
                .values()
                .filter(|a| a.quiz_id == quiz_id && a.student_id == student_id)
                .cloned()
                .collect();
            existing.sort_by_key(|a| a.started_at);
            let open = existing.iter().position(|a| !a.is_submitted());

            match open {
                Some(index) => (JoinOutcome::Resumed(existing.swap_remove(index)), None),
                None => match existing.pop() {
                    Some(done) => (JoinOutcome::AlreadySubmitted(done), None),
                    None if !active => {
                        return Err(ProctorError::store(format!("quiz {} is not active", quiz_id)));
                    }
                    None => {
                        let attempt = Attempt::new(Self::generate_attempt_id(), quiz_id, student_id);
                        state.attempts.insert(attempt.id.clone(), attempt.clone());
                        (JoinOutcome::Started(attempt.clone()), Some(attempt))
                    }
                },
            }
        };

        if let Some(attempt) = inserted {
            tracing::info!(quiz_id = %quiz_id, student_id = %student_id, attempt_id = %attempt.id, "Attempt started");
            self.publish(ChangeKind::Insert, &attempt);
        }
        Ok(outcome)
    }

    async fn fetch_attempt(&self, attempt_id: &str) -> Result<Attempt> {
        self.state()
            .attempts
            .get(attempt_id)
            .cloned()
            .ok_or_else(|| ProctorError::AttemptNotFound(attempt_id.to_string()))
    }

    async fn update_answers(&self, attempt_id: &str, answers: &AnswerMap) -> Result<()> {
        self.mutate_open(attempt_id, |attempt| attempt.answers = answers.clone())?;
        Ok(())
    }

    async fn append_warning(&self, attempt_id: &str, warning: &Warning) -> Result<()> {
        self.mutate_open(attempt_id, |attempt| attempt.warnings.push(warning.clone()))?;
        Ok(())
    }

    async fn finalize_attempt(&self, attempt_id: &str, submission: Submission) -> Result<Attempt> {
        let attempt = self.mutate_open(attempt_id, |attempt| {
            attempt.answers = submission.answers;
            attempt.warnings = submission.warnings;
            attempt.auto_submitted = submission.auto_submitted;
            attempt.score = Some(submission.score);
            attempt.submitted_at = Some(Utc::now());
            attempt.monitoring_available = false;
        })?;

        tracing::info!(
            attempt_id = %attempt_id,
            score = submission.score,
            auto_submitted = submission.auto_submitted,
            "Attempt finalized"
        );
        Ok(attempt)
    }

    async fn force_submit(&self, attempt_id: &str) -> Result<Attempt> {
        let attempt = Self::force_submit_locked(&mut self.state(), attempt_id)?;
        tracing::info!(attempt_id = %attempt_id, "Attempt force-submitted");
        self.publish(ChangeKind::Update, &attempt);
        Ok(attempt)
    }

    async fn force_submit_all(&self, quiz_id: &str) -> Result<usize> {
        let submitted = {
            let mut state = self.state();
            let open: Vec<String> = state
                .attempts
                .values()
                .filter(|a| a.quiz_id == quiz_id && !a.is_submitted())
                .map(|a| a.id.clone())
                .collect();

            let mut submitted = Vec::with_capacity(open.len());
            for attempt_id in open {
                submitted.push(Self::force_submit_locked(&mut state, &attempt_id)?);
            }
            submitted
        };

        for attempt in &submitted {
            self.publish(ChangeKind::Update, attempt);
        }
        tracing::info!(quiz_id = %quiz_id, count = submitted.len(), "Force-submitted all open attempts");
        Ok(submitted.len())
    }

    async fn list_attempts(&self, quiz_id: &str) -> Result<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .state()
            .attempts
            .values()
            .filter(|a| a.quiz_id == quiz_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.started_at);
        Ok(attempts)
    }

    async fn subscribe_to_attempts(&self, quiz_id: &str) -> Result<AttemptSubscription> {
        Ok(AttemptSubscription::new(quiz_id, self.changes.subscribe()))
    }

    async fn set_monitoring_available(&self, quiz_id: &str, student_id: &str, available: bool) -> Result<()> {
        let updated = {
            let mut state = self.state();
            let attempt = state
                .attempts
                .values_mut()
                .find(|a| a.quiz_id == quiz_id && a.student_id == student_id && !a.is_submitted());
            match attempt {
                Some(attempt) => {
                    attempt.monitoring_available = available;
                    attempt.clone()
                }
                None => {
                    return Err(ProctorError::store(format!(
                        "no open attempt for student {} in quiz {}",
                        student_id, quiz_id
                    )))
                }
            }
        };
        self.publish(ChangeKind::Update, &updated);
        Ok(())
    }

    async fn set_quiz_active(&self, quiz_id: &str, active: bool) -> Result<()> {
        let mut state = self.state();
        let quiz = state
            .quizzes
            .get_mut(quiz_id)
            .ok_or_else(|| ProctorError::store(format!("quiz {} not found", quiz_id)))?;
        quiz.is_active = active;
        tracing::info!(quiz_id = %quiz_id, active = active, "Quiz activity changed");
        Ok(())
    }
}
