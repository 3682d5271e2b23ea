//! Streaming transcription consumer and the shared transcript accept path.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use confab_audio::AudioChunk;
use confab_session::keys::OUTBOUND_SOCKET;
use confab_session::{AudioConsumer, ConsumerError, ResourceKey, SessionContext};
use confab_signal::WireMessage;
use confab_storage::ProjectStore;
use confab_stt::{FinalSegment, RecognizerFactory, StreamingRecognizer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RECOGNIZER: ResourceKey<Arc<dyn StreamingRecognizer>> = ResourceKey::new("recognizer");
const SEGMENT_DRAIN: ResourceKey<Mutex<Option<JoinHandle<()>>>> =
    ResourceKey::new("segment_drain");

/// Feeds session audio into a streaming recognizer.
///
/// The backend (local model or cloud stream) is chosen at boot via the
/// injected factory; a per-session recognizer is created on the first
/// chunk, bound to the chunk's sample rate. Finalized segments surface on
/// a channel that a session task drains through the accept path, so
/// provider callbacks never mutate session state from their own context.
pub struct TranscriberConsumer {
    factory: Arc<dyn RecognizerFactory>,
    store: Arc<dyn ProjectStore>,
}

impl TranscriberConsumer {
    pub fn new(factory: Arc<dyn RecognizerFactory>, store: Arc<dyn ProjectStore>) -> Self {
        Self { factory, store }
    }

    async fn recognizer(
        &self,
        ctx: &SessionContext,
        sample_rate: u32,
    ) -> Result<Arc<dyn StreamingRecognizer>, ConsumerError> {
        if let Some(existing) = ctx.get(RECOGNIZER).await? {
            // The map hands back Arc<Arc<dyn ...>>; clone out the inner handle.
            return Ok(Arc::clone(&*existing));
        }

        let (recognizer, segments) = self.factory.create(sample_rate).await?;
        ctx.register(RECOGNIZER, Arc::clone(&recognizer)).await?;

        let drain = tokio::spawn(drain_segments(
            ctx.clone(),
            Arc::clone(&self.store),
            segments,
        ));
        ctx.register(SEGMENT_DRAIN, Mutex::new(Some(drain))).await?;

        tracing::info!(
            session_id = %ctx.session_id(),
            backend = self.factory.name(),
            sample_rate,
            "transcriber ready"
        );
        Ok(recognizer)
    }
}

#[async_trait]
impl AudioConsumer for TranscriberConsumer {
    fn name(&self) -> &'static str {
        "transcriber"
    }

    async fn on_chunk(
        &self,
        ctx: &SessionContext,
        chunk: &AudioChunk,
    ) -> Result<(), ConsumerError> {
        let recognizer = self.recognizer(ctx, chunk.sample_rate_hz).await?;
        for frame in &chunk.frames {
            recognizer.accept_pcm(frame).await?;
        }
        Ok(())
    }

    async fn on_finalize(&self, ctx: &SessionContext) -> Result<(), ConsumerError> {
        let Some(recognizer) = ctx.get(RECOGNIZER).await? else {
            return Ok(());
        };
        recognizer.finalize().await?;

        // The recognizer closed its segment channel; wait for the drain
        // task so every finalized segment is accepted before teardown may
        // drop the session's resources.
        let handle = ctx
            .get(SEGMENT_DRAIN)
            .await?
            .and_then(|slot| slot.lock().expect("segment drain mutex poisoned").take());
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

async fn drain_segments(
    ctx: SessionContext,
    store: Arc<dyn ProjectStore>,
    mut segments: mpsc::Receiver<FinalSegment>,
) {
    while let Some(segment) = segments.recv().await {
        if let Err(error) = accept_transcript(&ctx, &store, segment.display_text()).await {
            tracing::warn!(
                session_id = %ctx.session_id(),
                %error,
                "failed to accept transcript segment"
            );
        }
    }
}

/// The shared acceptance path for a finalized segment: notify the client,
/// persist the row, feed the coalescer.
async fn accept_transcript(
    ctx: &SessionContext,
    store: &Arc<dyn ProjectStore>,
    text: String,
) -> Result<(), ConsumerError> {
    let socket = ctx.get_or_wait(OUTBOUND_SOCKET).await?;
    socket
        .send(WireMessage::transcription(text.clone()))
        .await?;

    let data = ctx.data().await?;
    let session_id = ctx.session_id();
    let transcript_id = {
        let store = Arc::clone(store);
        let text = text.clone();
        tokio::task::spawn_blocking(move || {
            store.append_transcript(data.user_id, session_id, data.project_id, &text)
        })
        .await??
    };

    ctx.accept_transcript(text, transcript_id).await?;
    Ok(())
}
