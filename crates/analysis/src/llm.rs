//! Analyzer backed by an OpenAI-compatible chat-completions endpoint.

use async_trait::async_trait;
use confab_session::ProjectId;
use serde::{Deserialize, Serialize};

use crate::{AIResult, AnalysisError, Analyzer, Result, Suggestion};

const SYSTEM_PROMPT: &str = "You are an interview copilot. Given the transcript of an \
ongoing conversation, propose follow-up questions the interviewer should ask next. \
Reply with a JSON array of objects, each with a `question_text` string and an optional \
`grounding_span` string quoting the part of the transcript that motivates the question. \
Reply with the JSON array only.";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Chat-completions endpoint, e.g. `https://api.openai.com/v1/chat/completions`.
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

pub struct LlmAnalyzer {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmAnalyzer {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn analyze(&self, project_id: ProjectId, transcript: &str) -> Result<AIResult> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: transcript,
                },
            ],
            temperature: 0.4,
        };

        let response: ChatResponse = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AnalysisError::MalformedReply("no choices in reply".to_string()))?;

        let suggestions = parse_suggestions(&content)?;
        tracing::debug!(
            project_id = %project_id,
            count = suggestions.len(),
            "llm analysis complete"
        );
        Ok(suggestions)
    }
}

/// Parse the model's reply, tolerating a fenced code block around the array.
fn parse_suggestions(content: &str) -> Result<Vec<Suggestion>> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|error| {
        AnalysisError::MalformedReply(format!("{error}; reply started: {:.80}", body))
    })
}
