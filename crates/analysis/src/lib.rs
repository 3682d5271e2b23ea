//! Transcript analysis: the pluggable analyzer contract and the bounded
//! worker pool that runs it off the session scheduler.

mod llm;
mod pool;
mod scripted;

pub use llm::{LlmAnalyzer, LlmConfig};
pub use pool::{PoolConfig, WorkerPool};
pub use scripted::ScriptedAnalyzer;

use async_trait::async_trait;
use confab_session::ProjectId;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("analyzer error: {0}")]
    Analyzer(String),
    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed analyzer reply: {0}")]
    MalformedReply(String),
    #[error(transparent)]
    Storage(#[from] confab_storage::StorageError),
    #[error(transparent)]
    Session(#[from] confab_session::SessionError),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// One follow-up question the analyzer proposes, with the transcript span
/// that grounds it (when the model provides one).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Suggestion {
    pub question_text: String,
    #[serde(default)]
    pub grounding_span: Option<String>,
}

/// Ordered analyzer output.
pub type AIResult = Vec<Suggestion>;

/// The analysis collaborator. Implementations may call external LLMs; the
/// pool makes no timing assumptions and only needs the future to be
/// cancellation-cooperative.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce suggestions for a project given its full transcript so far
    /// (fragments joined in creation order).
    async fn analyze(&self, project_id: ProjectId, transcript: &str) -> Result<AIResult>;
}
