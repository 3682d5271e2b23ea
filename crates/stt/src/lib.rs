//! Streaming speech-to-text backends.
//!
//! A recognizer takes int16 mono PCM pushes and emits *finalized* segments
//! on an event channel — never partial hypotheses. Local (Vosk) and cloud
//! (Deepgram live, diarizing) backends share one contract so the pipeline
//! consumer does not care which is configured.

mod deepgram;
mod local;

pub use deepgram::{DeepgramConfig, DeepgramFactory};
pub use local::VoskFactory;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("failed to load speech model from `{0}`")]
    ModelLoad(String),
    #[error("recognizer error: {0}")]
    Recognizer(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("provider message decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SttError>;

/// A span of speech the recognizer has declared stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalSegment {
    pub text: String,
    pub speaker: Option<String>,
}

impl FinalSegment {
    /// Render with the speaker tag the way downstream stores it.
    pub fn display_text(&self) -> String {
        match &self.speaker {
            Some(speaker) => format!("[{speaker}] {}", self.text.trim()),
            None => self.text.trim().to_string(),
        }
    }
}

/// One live recognition stream, bound to a sample rate at creation.
///
/// Finalized segments surface on the event channel handed out by the
/// factory; provider callbacks never touch caller state directly.
#[async_trait]
pub trait StreamingRecognizer: Send + Sync {
    /// Push int16 mono little-endian samples.
    async fn accept_pcm(&self, samples: &[i16]) -> Result<()>;

    /// Close the stream; flushes a trailing segment (if any) to the event
    /// channel and then closes it.
    async fn finalize(&self) -> Result<()>;
}

/// Builds a recognizer per session, lazily on the first audio chunk.
#[async_trait]
pub trait RecognizerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(
        &self,
        sample_rate: u32,
    ) -> Result<(Arc<dyn StreamingRecognizer>, mpsc::Receiver<FinalSegment>)>;
}

/// Capacity of the finalized-segment channel between a recognizer and the
/// session's drain task.
pub(crate) const SEGMENT_CHANNEL_CAPACITY: usize = 64;
