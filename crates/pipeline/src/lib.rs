//! The per-session audio pipeline and its consumers.
//!
//! [`run_track`] reads decoded frames from a transport, normalizes them to
//! 16-bit mono at the configured rate, and drives the session's consumer
//! list. The two shipped consumers persist a WAV recording and stream the
//! audio into a speech recognizer whose finalized segments flow through
//! the shared transcript accept path.

mod recording;
mod track;
mod transcribe;

pub use recording::RecordingConsumer;
pub use track::{run_track, PipelineConfig, TrackSource};
pub use transcribe::TranscriberConsumer;
