//! PCM audio primitives for the ingestion pipeline.
//!
//! Everything downstream of the decoder works on 16-bit mono PCM. This crate
//! owns the chunk model, channel-layout normalization, resampling, and WAV
//! output; it knows nothing about sessions or transports.

mod chunk;
mod pcm;
mod resample;
mod wav;

pub use chunk::{AudioChunk, DecodedFrame};
pub use pcm::{f32_to_i16, i16_to_f32, to_mono};
pub use resample::StreamResampler;
pub use wav::WavSink;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error("resampler construction failed: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
    #[error("audio sink already finalized")]
    SinkFinalized,
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;
