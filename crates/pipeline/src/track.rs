//! Frame loop: decode transport → normalize → buffer → fan out.

use async_trait::async_trait;
use confab_audio::{f32_to_i16, i16_to_f32, to_mono, AudioChunk, DecodedFrame, StreamResampler};
use confab_session::SessionContext;

/// Where decoded audio frames come from (a WebRTC track in production,
/// a scripted source in tests). Reading ends with `Ok(None)` at
/// end-of-stream or `Err` on transport failure.
#[async_trait]
pub trait TrackSource: Send {
    async fn next_frame(&mut self) -> confab_audio::Result<Option<DecodedFrame>>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Every chunk leaving the pipeline is mono at this rate.
    pub target_sample_rate: u32,
    /// Buffered frame count that triggers a chunk flush.
    pub flush_frames: usize,
}

impl PipelineConfig {
    pub fn new(target_sample_rate: u32) -> Self {
        Self {
            target_sample_rate,
            flush_frames: 100,
        }
    }
}

/// Drive one audio track to completion.
///
/// Frames are normalized to mono i16 at the target rate, accumulated, and
/// flushed to the session's consumers every `flush_frames` frames. The
/// exit path always runs: remaining frames are flushed, every consumer's
/// finalizer is invoked, and the session's audio-active flag is cleared so
/// teardown can proceed.
pub async fn run_track<S: TrackSource>(ctx: SessionContext, mut source: S, config: PipelineConfig) {
    let session_id = ctx.session_id();
    if let Err(error) = ctx.set_audio_active().await {
        tracing::error!(session_id = %session_id, %error, "cannot start audio pipeline");
        return;
    }
    let cancel = match ctx.cancellation_token().await {
        Ok(cancel) => cancel,
        Err(error) => {
            tracing::error!(session_id = %session_id, %error, "session scope unavailable");
            ctx.clear_audio_active().await;
            return;
        }
    };
    tracing::info!(session_id = %session_id, "audio pipeline started");

    let mut resampler: Option<StreamResampler> = None;
    let mut pending: Vec<Vec<i16>> = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                if frame.is_empty() {
                    continue;
                }
                let mono = to_mono(&frame);
                let samples = if frame.sample_rate == config.target_sample_rate {
                    mono
                } else {
                    match resample(&mut resampler, &mono, frame.sample_rate, config) {
                        Some(samples) => samples,
                        None => continue,
                    }
                };
                if samples.is_empty() {
                    // Resampler is still buffering a partial chunk.
                    continue;
                }

                pending.push(samples);
                if pending.len() >= config.flush_frames {
                    flush(&ctx, &mut pending, config.target_sample_rate).await;
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(session_id = %session_id, %error, "audio transport failed");
                break;
            }
        }
    }

    // Exit path, taken on end-of-stream, transport error, and cancellation
    // alike: drain the buffer, finalize every consumer, release teardown.
    flush(&ctx, &mut pending, config.target_sample_rate).await;
    ctx.finalize_consumers().await;
    ctx.clear_audio_active().await;
    tracing::info!(session_id = %session_id, "audio pipeline finished");
}

fn resample(
    resampler: &mut Option<StreamResampler>,
    mono: &[i16],
    source_rate: u32,
    config: PipelineConfig,
) -> Option<Vec<i16>> {
    let needs_new = resampler
        .as_ref()
        .map_or(true, |r| r.from_rate() != source_rate);
    if needs_new {
        match StreamResampler::new(source_rate, config.target_sample_rate) {
            Ok(new) => *resampler = Some(new),
            Err(error) => {
                tracing::warn!(%error, source_rate, "cannot build resampler, dropping frame");
                return None;
            }
        }
    }
    let resampler = resampler.as_mut().expect("resampler just created");
    match resampler.process(&i16_to_f32(mono)) {
        Ok(resampled) => Some(f32_to_i16(&resampled)),
        Err(error) => {
            tracing::warn!(%error, "resampling failed, dropping frame");
            None
        }
    }
}

async fn flush(ctx: &SessionContext, pending: &mut Vec<Vec<i16>>, sample_rate: u32) {
    if pending.is_empty() {
        return;
    }
    let chunk = AudioChunk::new(std::mem::take(pending), sample_rate);
    if let Err(error) = ctx.ingest_audio(&chunk).await {
        tracing::warn!(session_id = %ctx.session_id(), %error, "chunk delivery failed");
    }
}
