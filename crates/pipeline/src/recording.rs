//! Persistent WAV recording of the session's normalized audio.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use confab_audio::{AudioChunk, WavSink};
use confab_session::{AudioConsumer, ConsumerError, ResourceKey, SessionContext};

const WAV_SINK: ResourceKey<Mutex<WavSink>> = ResourceKey::new("wav_sink");

/// Appends every chunk to `<recordings_dir>/recording-<session>.wav`.
///
/// The file is opened lazily on the first chunk and only becomes a valid
/// WAV at finalize, when the RIFF sizes are rewritten. A session that never
/// finalizes leaves the file incomplete by design.
pub struct RecordingConsumer {
    recordings_dir: PathBuf,
    sample_rate: u32,
}

impl RecordingConsumer {
    pub fn new(recordings_dir: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
            sample_rate,
        }
    }

    async fn open_sink(&self, ctx: &SessionContext) -> Result<Arc<Mutex<WavSink>>, ConsumerError> {
        let path = self
            .recordings_dir
            .join(format!("recording-{}.wav", ctx.session_id()));
        let sample_rate = self.sample_rate;
        let sink =
            tokio::task::spawn_blocking(move || WavSink::create(&path, sample_rate, 1)).await??;
        ctx.register(WAV_SINK, Mutex::new(sink)).await?;
        Ok(ctx
            .get(WAV_SINK)
            .await?
            .expect("wav sink registered just above"))
    }
}

#[async_trait]
impl AudioConsumer for RecordingConsumer {
    fn name(&self) -> &'static str {
        "wav_recorder"
    }

    async fn on_chunk(
        &self,
        ctx: &SessionContext,
        chunk: &AudioChunk,
    ) -> Result<(), ConsumerError> {
        let sink = match ctx.get(WAV_SINK).await? {
            Some(sink) => sink,
            None => self.open_sink(ctx).await?,
        };

        let samples = chunk.concat();
        tokio::task::spawn_blocking(move || {
            sink.lock().expect("wav sink mutex poisoned").append(&samples)
        })
        .await??;
        Ok(())
    }

    async fn on_finalize(&self, ctx: &SessionContext) -> Result<(), ConsumerError> {
        // No chunk ever arrived: nothing to close.
        let Some(sink) = ctx.get(WAV_SINK).await? else {
            return Ok(());
        };

        let path = tokio::task::spawn_blocking(move || {
            let mut sink = sink.lock().expect("wav sink mutex poisoned");
            sink.finalize().map(|_| sink.path().to_path_buf())
        })
        .await??;
        tracing::info!(session_id = %ctx.session_id(), path = %path.display(), "recording closed");
        Ok(())
    }
}
