pub mod draft;
pub mod model;
pub mod runner;
pub mod scoring;
pub mod store;
pub mod submission;

pub use draft::{AttemptDraft, DraftPhase, SubmissionTicket, WarningAppended};
pub use model::{AnswerMap, Attempt, Question, QuestionKind, Quiz, QuizSettings, Submission};
pub use runner::{QuizRunner, RunnerDeps, RunnerOutcome};
pub use scoring::{is_correct, score_answers};
pub use store::{
    AttemptChange, AttemptStore, AttemptSubscription, ChangeKind, InMemoryAttemptStore, JoinOutcome,
};
pub use submission::{SubmissionPipeline, SubmitOutcome};
