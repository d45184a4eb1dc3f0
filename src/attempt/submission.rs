use std::sync::Arc;
use std::time::Duration;

use super::draft::{AttemptDraft, SubmissionTicket};
use super::model::Submission;
use super::scoring::score_answers;
use super::store::AttemptStore;
use crate::config::ProctoringConfig;
use crate::error::{ProctorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { score: u32, auto_submitted: bool },
    /// Another trigger already submitted, or is submitting, this attempt.
    AlreadySubmitted,
}

/// Shared finalize path for manual, timer, threshold and remote triggers.
pub struct SubmissionPipeline {
    store: Arc<dyn AttemptStore>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl SubmissionPipeline {
    pub fn new(store: Arc<dyn AttemptStore>, config: &ProctoringConfig) -> Self {
        Self {
            store,
            retry_attempts: config.submit_retry_attempts.max(1),
            retry_delay: config.submit_retry_delay,
        }
    }

    /// Submits the draft unless a submission already claimed it.
    pub async fn submit(&self, draft: &AttemptDraft, auto_submitted: bool) -> Result<SubmitOutcome> {
        match draft.begin_submission(auto_submitted) {
            Some(ticket) => self.finalize(draft, ticket).await,
            None => {
                tracing::debug!(attempt_id = %draft.attempt_id(), "Submission already claimed, ignoring trigger");
                Ok(SubmitOutcome::AlreadySubmitted)
            }
        }
    }

    /// Retries a timed or threshold submission the store refused earlier.
    pub async fn retry(&self, draft: &AttemptDraft) -> Result<SubmitOutcome> {
        match draft.resume_submission() {
            Some(ticket) => self.finalize(draft, ticket).await,
            None => Ok(SubmitOutcome::AlreadySubmitted),
        }
    }

    /// Scores the ticket and finalizes it in the store. On failure the
    /// attempt must not be reported as submitted: a manual submission reopens
    /// the draft, an automatic one parks it as `Failed` for `retry`.
    pub async fn finalize(&self, draft: &AttemptDraft, ticket: SubmissionTicket) -> Result<SubmitOutcome> {
        let attempt_id = draft.attempt_id().to_string();
        let score = score_answers(draft.questions(), &ticket.answers);
        let submission = Submission {
            answers: ticket.answers.clone(),
            warnings: ticket.warnings.clone(),
            auto_submitted: ticket.auto_submitted,
            score,
        };

        tracing::info!(
            attempt_id = %attempt_id,
            score = score,
            auto_submitted = submission.auto_submitted,
            warnings = submission.warnings.len(),
            "Submitting attempt"
        );

        let mut last_error = None;
        for attempt in 0..self.retry_attempts {
            match self.store.finalize_attempt(&attempt_id, submission.clone()).await {
                Ok(_) => {
                    draft.complete_submission(score, submission.auto_submitted);
                    return Ok(SubmitOutcome::Submitted {
                        score,
                        auto_submitted: submission.auto_submitted,
                    });
                }
                Err(ProctorError::AlreadySubmitted(_)) => {
                    // Finalized elsewhere; adopt the stored outcome.
                    match self.store.fetch_attempt(&attempt_id).await {
                        Ok(stored) => draft.mark_submitted_remotely(&stored),
                        Err(e) => {
                            tracing::warn!(attempt_id = %attempt_id, error = %e, "Could not read back submitted attempt");
                            draft.settle_submitted();
                        }
                    }
                    return Ok(SubmitOutcome::AlreadySubmitted);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry_attempts,
                        retryable = retryable,
                        attempt_id = %attempt_id,
                        error = %e,
                        "Finalize failed"
                    );
                    last_error = Some(e);

                    if !retryable {
                        break;
                    }
                    if attempt + 1 < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "finalize was not attempted".to_string());
        if ticket.auto_submitted {
            draft.fail_submission(ticket, reason.clone());
        } else {
            draft.abort_submission();
        }
        tracing::error!(attempt_id = %attempt_id, reason = %reason, "Attempt submission failed");

        Err(ProctorError::SubmissionFailed { attempt_id, reason })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::attempt::draft::DraftPhase;
    use crate::attempt::model::{AnswerMap, Attempt, Question, QuestionKind, Quiz, QuizSettings};
    use crate::attempt::store::{AttemptSubscription, InMemoryAttemptStore, JoinOutcome};
    use crate::integrity::Warning;

    /// Delegates to the in-memory store but rejects the first `failures`
    /// finalize calls.
    struct FlakyStore {
        inner: InMemoryAttemptStore,
        failures: AtomicU32,
        finalize_calls: AtomicU32,
        fail_fetch: AtomicBool,
    }

    #[async_trait]
    impl AttemptStore for FlakyStore {
        async fn fetch_quiz(&self, quiz_id: &str) -> Result<Quiz> {
            self.inner.fetch_quiz(quiz_id).await
        }
        async fn create_or_resume_attempt(&self, quiz_id: &str, student_id: &str) -> Result<JoinOutcome> {
            self.inner.create_or_resume_attempt(quiz_id, student_id).await
        }
        async fn fetch_attempt(&self, attempt_id: &str) -> Result<Attempt> {
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(ProctorError::store("read timed out"));
            }
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
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ProctorError::store("connection reset"));
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

    fn quiz() -> Quiz {
        Quiz {
            id: "quiz-1".to_string(),
            title: "Quiz".to_string(),
            description: String::new(),
            settings: QuizSettings::default(),
            questions: vec![Question {
                id: "q1".to_string(),
                text: "Pick the primes".to_string(),
                kind: QuestionKind::MultipleChoice,
                options: vec!["2".into(), "4".into(), "5".into()],
                correct_answers: vec![0, 2],
                points: 2,
            }],
            is_active: true,
        }
    }

    async fn setup(failures: u32) -> (Arc<FlakyStore>, Arc<AttemptDraft>, SubmissionPipeline) {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAttemptStore::new(),
            failures: AtomicU32::new(failures),
            finalize_calls: AtomicU32::new(0),
            fail_fetch: AtomicBool::new(false),
        });
        store.inner.insert_quiz(quiz()).unwrap();
        let attempt = store
            .create_or_resume_attempt("quiz-1", "s1")
            .await
            .unwrap()
            .attempt()
            .clone();
        let draft = AttemptDraft::new(&attempt, &quiz());

        let config = ProctoringConfig {
            submit_retry_attempts: 3,
            submit_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let pipeline = SubmissionPipeline::new(store.clone(), &config);
        (store, draft, pipeline)
    }

    #[tokio::test]
    async fn test_submit_scores_and_finalizes() {
        let (store, draft, pipeline) = setup(0).await;
        draft.set_answer("q1", 0, true).unwrap();
        draft.set_answer("q1", 2, true).unwrap();

        let outcome = pipeline.submit(&draft, false).await.unwrap();

        assert_eq!(
            outcome,
            SubmitOutcome::Submitted {
                score: 100,
                auto_submitted: false
            }
        );
        let stored = store.fetch_attempt(draft.attempt_id()).await.unwrap();
        assert!(stored.submitted_at.is_some());
        assert_eq!(stored.score, Some(100));
        assert_eq!(draft.phase(), DraftPhase::Submitted);
    }

    #[tokio::test]
    async fn test_second_trigger_is_noop() {
        let (store, draft, pipeline) = setup(0).await;

        pipeline.submit(&draft, false).await.unwrap();
        let again = pipeline.submit(&draft, true).await.unwrap();

        assert_eq!(again, SubmitOutcome::AlreadySubmitted);
        assert_eq!(store.finalize_calls.load(Ordering::SeqCst), 1);
        assert!(!store.fetch_attempt(draft.attempt_id()).await.unwrap().auto_submitted);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, draft, pipeline) = setup(2).await;

        let outcome = pipeline.submit(&draft, true).await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Submitted { auto_submitted: true, .. }));
        assert_eq!(store.finalize_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_reopen_the_draft() {
        let (store, draft, pipeline) = setup(10).await;

        let result = pipeline.submit(&draft, false).await;

        assert!(matches!(result, Err(ProctorError::SubmissionFailed { .. })));
        assert_eq!(draft.phase(), DraftPhase::Open);
        assert!(store.fetch_attempt(draft.attempt_id()).await.unwrap().submitted_at.is_none());
    }

    #[tokio::test]
    async fn test_remote_finalize_is_adopted() {
        let (store, draft, pipeline) = setup(0).await;
        store.force_submit(draft.attempt_id()).await.unwrap();

        let outcome = pipeline.submit(&draft, false).await.unwrap();

        assert_eq!(outcome, SubmitOutcome::AlreadySubmitted);
        assert_eq!(draft.phase(), DraftPhase::Submitted);
        assert!(draft.auto_submitted());
    }

    #[tokio::test]
    async fn test_failed_auto_submit_is_parked_then_retried() {
        let (store, draft, pipeline) = setup(10).await;
        draft.set_answer("q1", 0, true).unwrap();

        let result = pipeline.submit(&draft, true).await;

        assert!(matches!(result, Err(ProctorError::SubmissionFailed { .. })));
        assert_eq!(draft.phase(), DraftPhase::Failed);
        assert!(draft.set_answer("q1", 2, true).is_err());
        assert_eq!(pipeline.submit(&draft, false).await.unwrap(), SubmitOutcome::AlreadySubmitted);

        store.failures.store(0, Ordering::SeqCst);
        let outcome = pipeline.retry(&draft).await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Submitted { auto_submitted: true, .. }));
        assert_eq!(draft.phase(), DraftPhase::Submitted);
        let stored = store.fetch_attempt(draft.attempt_id()).await.unwrap();
        assert!(stored.auto_submitted);
        assert_eq!(stored.answers["q1"], vec![0]);
    }

    #[tokio::test]
    async fn test_unreadable_remote_finalize_keeps_local_flags() {
        let (store, draft, pipeline) = setup(0).await;
        store.inner.force_submit(draft.attempt_id()).await.unwrap();
        store.fail_fetch.store(true, Ordering::SeqCst);

        let outcome = pipeline.submit(&draft, false).await.unwrap();

        assert_eq!(outcome, SubmitOutcome::AlreadySubmitted);
        assert_eq!(draft.phase(), DraftPhase::Submitted);
        assert_eq!(draft.score(), None);
        assert!(!draft.auto_submitted());
    }
}
