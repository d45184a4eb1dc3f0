//! Live proctoring core for online quizzes: signaling, peer sessions,
//! integrity monitoring and attempt submission.

pub mod api;
pub mod attempt;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod generation;
pub mod integrity;
pub mod peer;
pub mod proctor;
pub mod signaling;

pub use error::{ProctorError, Result};
