use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use super::model::{AnswerMap, Attempt, Question, QuestionKind, Quiz, QuizSettings};
use crate::error::{ProctorError, Result};
use crate::integrity::Warning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftPhase {
    Open,
    /// A submission is in flight; no further local mutation.
    Submitting,
    /// A timed or threshold submission was claimed but the store refused it.
    /// The draft stays locked until the same submission is retried.
    Failed,
    Submitted,
}

/// Snapshot taken when a submission claims the draft. Only one ticket can be
/// outstanding per attempt.
#[derive(Debug, Clone)]
pub struct SubmissionTicket {
    pub auto_submitted: bool,
    pub answers: AnswerMap,
    pub warnings: Vec<Warning>,
}

#[derive(Debug)]
pub struct WarningAppended {
    pub count: usize,
    pub threshold: u32,
    /// Present when this warning crossed the threshold and claimed submission.
    pub ticket: Option<SubmissionTicket>,
}

struct DraftState {
    phase: DraftPhase,
    answers: AnswerMap,
    warnings: Vec<Warning>,
    score: Option<u32>,
    auto_submitted: bool,
    pending: Option<SubmissionTicket>,
    failure: Option<String>,
}

/// Authoritative in-memory state of one attempt on the student side.
///
/// Every check-then-act on the attempt (threshold crossing, submission
/// claim) happens under a single lock, so concurrent triggers cannot both
/// start a submission.
pub struct AttemptDraft {
    attempt_id: String,
    quiz_id: String,
    student_id: String,
    settings: QuizSettings,
    questions: Vec<Question>,
    state: Mutex<DraftState>,
    phase_tx: watch::Sender<DraftPhase>,
}

impl AttemptDraft {
    pub fn new(attempt: &Attempt, quiz: &Quiz) -> Arc<Self> {
        let phase = if attempt.is_submitted() {
            DraftPhase::Submitted
        } else {
            DraftPhase::Open
        };
        let (phase_tx, _) = watch::channel(phase);

        Arc::new(Self {
            attempt_id: attempt.id.clone(),
            quiz_id: attempt.quiz_id.clone(),
            student_id: attempt.student_id.clone(),
            settings: quiz.settings.clone(),
            questions: quiz.questions.clone(),
            state: Mutex::new(DraftState {
                phase,
                answers: attempt.answers.clone(),
                warnings: attempt.warnings.clone(),
                score: attempt.score,
                auto_submitted: attempt.auto_submitted,
                pending: None,
                failure: None,
            }),
            phase_tx,
        })
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn quiz_id(&self) -> &str {
        &self.quiz_id
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn settings(&self) -> &QuizSettings {
        &self.settings
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn phase(&self) -> DraftPhase {
        self.state().phase
    }

    pub fn watch_phase(&self) -> watch::Receiver<DraftPhase> {
        self.phase_tx.subscribe()
    }

    pub fn answers(&self) -> AnswerMap {
        self.state().answers.clone()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.state().warnings.clone()
    }

    pub fn warning_count(&self) -> usize {
        self.state().warnings.len()
    }

    pub fn score(&self) -> Option<u32> {
        self.state().score
    }

    pub fn auto_submitted(&self) -> bool {
        self.state().auto_submitted
    }

    /// Why the last parked submission was refused.
    pub fn failure(&self) -> Option<String> {
        self.state().failure.clone()
    }

    /// Applies a click on an option: single-choice replaces the selection,
    /// multiple-choice adds or removes the option.
    pub fn set_answer(&self, question_id: &str, option: usize, checked: bool) -> Result<AnswerMap> {
        let question = self
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .ok_or_else(|| ProctorError::QuestionNotFound(question_id.to_string()))?;
        if option >= question.options.len() {
            return Err(ProctorError::InvalidSettings(format!(
                "question {} has no option {}",
                question_id, option
            )));
        }

        let mut state = self.state();
        if state.phase != DraftPhase::Open {
            return Err(ProctorError::AttemptClosed(self.attempt_id.clone()));
        }

        match question.kind {
            QuestionKind::SingleChoice => {
                if checked {
                    state.answers.insert(question_id.to_string(), vec![option]);
                }
            }
            QuestionKind::MultipleChoice => {
                let selected = state.answers.entry(question_id.to_string()).or_default();
                if checked {
                    if !selected.contains(&option) {
                        selected.push(option);
                    }
                } else {
                    selected.retain(|&i| i != option);
                    if selected.is_empty() {
                        state.answers.remove(question_id);
                    }
                }
            }
        }
        Ok(state.answers.clone())
    }

    /// Appends a warning and, if the count reaches the allowed threshold,
    /// claims submission in the same step.
    pub fn append_warning(&self, warning: Warning) -> Result<WarningAppended> {
        let mut state = self.state();
        if state.phase != DraftPhase::Open {
            return Err(ProctorError::AttemptClosed(self.attempt_id.clone()));
        }

        state.warnings.push(warning);
        let count = state.warnings.len();
        let threshold = self.settings.allowed_warnings;

        let ticket = if count >= threshold as usize {
            Some(self.claim(&mut state, true))
        } else {
            None
        };

        Ok(WarningAppended {
            count,
            threshold,
            ticket,
        })
    }

    /// Claims the draft for submission. `None` when a submission is already
    /// in flight or done.
    pub fn begin_submission(&self, auto_submitted: bool) -> Option<SubmissionTicket> {
        let mut state = self.state();
        if state.phase != DraftPhase::Open {
            return None;
        }
        Some(self.claim(&mut state, auto_submitted))
    }

    fn claim(&self, state: &mut DraftState, auto_submitted: bool) -> SubmissionTicket {
        state.phase = DraftPhase::Submitting;
        self.phase_tx.send_replace(DraftPhase::Submitting);
        SubmissionTicket {
            auto_submitted,
            answers: state.answers.clone(),
            warnings: state.warnings.clone(),
        }
    }

    pub fn complete_submission(&self, score: u32, auto_submitted: bool) {
        let mut state = self.state();
        state.phase = DraftPhase::Submitted;
        state.pending = None;
        state.failure = None;
        state.score = Some(score);
        state.auto_submitted = auto_submitted;
        self.phase_tx.send_replace(DraftPhase::Submitted);
    }

    /// Reopens the draft after the store refused to finalize it.
    pub fn abort_submission(&self) {
        let mut state = self.state();
        if state.phase == DraftPhase::Submitting {
            state.phase = DraftPhase::Open;
            self.phase_tx.send_replace(DraftPhase::Open);
        }
    }

    /// Parks a refused submission. Unlike `abort_submission` the draft stays
    /// closed to edits and warnings; only `resume_submission` moves it on.
    pub fn fail_submission(&self, ticket: SubmissionTicket, reason: String) {
        let mut state = self.state();
        if state.phase == DraftPhase::Submitting {
            state.phase = DraftPhase::Failed;
            state.pending = Some(ticket);
            state.failure = Some(reason);
            self.phase_tx.send_replace(DraftPhase::Failed);
        }
    }

    /// Reclaims the parked submission for another finalize attempt.
    pub fn resume_submission(&self) -> Option<SubmissionTicket> {
        let mut state = self.state();
        if state.phase != DraftPhase::Failed {
            return None;
        }
        let ticket = state.pending.take()?;
        state.phase = DraftPhase::Submitting;
        self.phase_tx.send_replace(DraftPhase::Submitting);
        Some(ticket)
    }

    /// The store reports the attempt finalized but its outcome is unknown.
    /// Closes the draft without touching score or flags.
    pub fn settle_submitted(&self) {
        let mut state = self.state();
        if state.phase == DraftPhase::Submitted {
            return;
        }
        state.phase = DraftPhase::Submitted;
        state.pending = None;
        state.failure = None;
        self.phase_tx.send_replace(DraftPhase::Submitted);
    }

    /// Adopts a submission made elsewhere (professor force-submit). Final.
    pub fn mark_submitted_remotely(&self, attempt: &Attempt) {
        let mut state = self.state();
        if state.phase == DraftPhase::Submitted {
            return;
        }
        state.phase = DraftPhase::Submitted;
        state.pending = None;
        state.failure = None;
        state.score = attempt.score;
        state.auto_submitted = attempt.auto_submitted;
        self.phase_tx.send_replace(DraftPhase::Submitted);
    }

    fn state(&self) -> MutexGuard<'_, DraftState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
