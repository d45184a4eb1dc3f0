use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProctorError, Result};
use crate::integrity::Warning;

/// Selected option indices per question id.
pub type AnswerMap = BTreeMap<String, Vec<usize>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizSettings {
    /// Minutes.
    pub time_limit: u32,
    pub shuffle_questions: bool,
    pub show_results: bool,
    pub monitoring_enabled: bool,
    pub allowed_warnings: u32,
}

impl Default for QuizSettings {
    fn default() -> Self {
        Self {
            time_limit: 30,
            shuffle_questions: true,
            show_results: true,
            monitoring_enabled: true,
            allowed_warnings: 3,
        }
    }
}

impl QuizSettings {
    pub fn validate(&self) -> Result<()> {
        if self.time_limit == 0 {
            return Err(ProctorError::InvalidSettings(
                "timeLimit must be greater than zero".to_string(),
            ));
        }
        if self.allowed_warnings == 0 {
            return Err(ProctorError::InvalidSettings(
                "allowedWarnings must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    SingleChoice,
    MultipleChoice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub options: Vec<String>,
    pub correct_answers: Vec<usize>,
    pub points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub settings: QuizSettings,
    pub questions: Vec<Question>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Quiz {
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: String,
    pub quiz_id: String,
    pub student_id: String,
    pub started_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub answers: AnswerMap,
    pub warnings: Vec<Warning>,
    pub auto_submitted: bool,
    /// Percentage, set on submission.
    pub score: Option<u32>,
    pub monitoring_available: bool,
}

impl Attempt {
    pub fn new(id: impl Into<String>, quiz_id: &str, student_id: &str) -> Self {
        Self {
            id: id.into(),
            quiz_id: quiz_id.to_string(),
            student_id: student_id.to_string(),
            started_at: Utc::now(),
            submitted_at: None,
            answers: AnswerMap::new(),
            warnings: Vec::new(),
            auto_submitted: false,
            score: None,
            monitoring_available: false,
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

/// Final state handed to the store when an attempt is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub answers: AnswerMap,
    pub warnings: Vec<Warning>,
    pub auto_submitted: bool,
    pub score: u32,
}
