//! Canned analyzer for development runs without an LLM configured.

use async_trait::async_trait;
use confab_session::ProjectId;

use crate::{AIResult, Analyzer, Result, Suggestion};

/// Returns a fixed suggestion list on every call.
pub struct ScriptedAnalyzer {
    suggestions: Vec<Suggestion>,
}

impl ScriptedAnalyzer {
    pub fn new(suggestions: Vec<Suggestion>) -> Self {
        Self { suggestions }
    }
}

impl Default for ScriptedAnalyzer {
    fn default() -> Self {
        Self::new(vec![Suggestion {
            question_text: "Can you walk me through that in more detail?".to_string(),
            grounding_span: None,
        }])
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn analyze(&self, _project_id: ProjectId, _transcript: &str) -> Result<AIResult> {
        Ok(self.suggestions.clone())
    }
}
