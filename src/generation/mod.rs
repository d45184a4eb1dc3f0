//! Draft quiz questions from a chat-completion model.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::attempt::{Question, QuestionKind};
use crate::config::GenerationConfig;
use crate::error::{ProctorError, Result};

pub const MAX_QUESTIONS: u32 = 10;
const PLACEHOLDER_OPTIONS: [&str; 4] = ["Option 1", "Option 2", "Option 3", "Option 4"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Moderate,
    Hard,
    Expert,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Difficulty::Easy => "easy",
            Difficulty::Moderate => "moderate",
            Difficulty::Hard => "hard",
            Difficulty::Expert => "expert",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(rename = "numQuestions")]
    pub count: u32,
    #[serde(default)]
    pub difficulty: Difficulty,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, count: u32, difficulty: Difficulty) -> Self {
        Self {
            topic: topic.into(),
            count,
            difficulty,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(ProctorError::InvalidGenerationRequest(
                "Topic is required".to_string(),
            ));
        }
        if !(1..=MAX_QUESTIONS).contains(&self.count) {
            return Err(ProctorError::InvalidGenerationRequest(format!(
                "Question count must be between 1 and {}, got {}",
                MAX_QUESTIONS, self.count
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait QuestionGenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Question>>;
}

pub struct OpenAiQuestionGenerator {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl OpenAiQuestionGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProctorError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system_prompt(request) },
                {
                    "role": "user",
                    "content": format!(
                        "Generate {} quiz questions about {} at {} difficulty.",
                        request.count, request.topic, request.difficulty
                    ),
                },
            ],
            "temperature": 0.7,
            "max_tokens": 2000,
        })
    }
}

#[async_trait]
impl QuestionGenerationService for OpenAiQuestionGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Question>> {
        request.validate()?;

        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            ProctorError::InvalidConfiguration("QUESTION_API_KEY is not set".to_string())
        })?;

        tracing::info!(
            topic = %request.topic,
            count = request.count,
            difficulty = %request.difficulty,
            "Requesting generated questions"
        );

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProctorError::Generation(format!(
                "Completion request failed with status {}: {}",
                status, error_text
            )));
        }

        let body: Value = response.json().await?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                tracing::error!(response = %body, "Unexpected completion response");
                ProctorError::Generation("Invalid response from completion API".to_string())
            })?;

        let questions = parse_generated(content)?;
        tracing::info!(generated = questions.len(), "Questions generated");
        Ok(questions)
    }
}

fn system_prompt(request: &GenerationRequest) -> String {
    format!(
        r#"You are an educational quiz question generator. Generate {count} multiple-choice quiz questions about "{topic}" at {difficulty} difficulty level.

For each question:
1. Create a clear, concise question text
2. Provide 4 possible answer options
3. Indicate which option(s) is correct (only one for single-choice questions)
4. Assign a point value (1-5 based on difficulty)

Format your response as a JSON array with this structure:
[
  {{
    "text": "Question text here?",
    "type": "single-choice",
    "options": ["Option 1", "Option 2", "Option 3", "Option 4"],
    "correctAnswers": [0],
    "points": 2
  }}
]

Keep questions focused on the topic, answers under 10 words, and avoid duplicate questions or options."#,
        count = request.count,
        topic = request.topic,
        difficulty = request.difficulty,
    )
}

/// Parses a model reply into questions. The reply may wrap the JSON array
/// in prose; loosely-typed fields are normalised.
pub fn parse_generated(content: &str) -> Result<Vec<Question>> {
    let items: Vec<Value> = serde_json::from_str(extract_json_array(content)).map_err(|e| {
        ProctorError::Generation(format!("Failed to parse generated questions: {}", e))
    })?;

    let stamp = Utc::now().timestamp_millis();
    Ok(items
        .iter()
        .enumerate()
        .map(|(index, item)| normalize(item, format!("q-{}-{}", stamp, index)))
        .collect())
}

fn extract_json_array(content: &str) -> &str {
    let start = content.find('[');
    let end = content.rfind(']');
    match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    }
}

fn normalize(item: &Value, id: String) -> Question {
    let kind = match item.get("type").and_then(Value::as_str) {
        Some("multiple-choice") => QuestionKind::MultipleChoice,
        _ => QuestionKind::SingleChoice,
    };

    let options: Vec<String> = item
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .map(|o| match o {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .filter(|opts: &Vec<String>| !opts.is_empty())
        .unwrap_or_else(|| PLACEHOLDER_OPTIONS.iter().map(|s| s.to_string()).collect());

    let correct_answers = item
        .get("correctAnswers")
        .and_then(Value::as_array)
        .map(|answers| {
            answers
                .iter()
                .filter_map(Value::as_u64)
                .map(|i| i as usize)
                .collect()
        })
        .unwrap_or_else(|| vec![0]);

    let points = item
        .get("points")
        .and_then(Value::as_u64)
        .filter(|p| (1..=5).contains(p))
        .map(|p| p as u32)
        .unwrap_or(1);

    Question {
        id,
        text: item
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        kind,
        options,
        correct_answers,
        points,
    }
}
