use async_trait::async_trait;
use confab_audio::AudioChunk;

use crate::SessionContext;

/// Consumers report their own error types; the fan-out only logs them.
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// One leg of the per-session audio fan-out.
///
/// `on_chunk` and `on_finalize` are scheduled serially per session: the
/// pipeline never delivers the next chunk until every consumer has returned
/// from the current one. Per-session side resources (file handles,
/// recognizers) are acquired lazily on the first chunk and registered in
/// the session resource map so the finalizer can find them.
#[async_trait]
pub trait AudioConsumer: Send + Sync {
    /// Stable name used in log lines.
    fn name(&self) -> &'static str;

    async fn on_chunk(
        &self,
        ctx: &SessionContext,
        chunk: &AudioChunk,
    ) -> Result<(), ConsumerError>;

    /// Called once when the audio stream ends, after the last chunk.
    async fn on_finalize(&self, ctx: &SessionContext) -> Result<(), ConsumerError>;
}
