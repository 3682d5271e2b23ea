//! Incremental WAV output for session recordings.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::{AudioError, Result};

/// A WAV file being written incrementally, one chunk at a time.
///
/// The RIFF size fields are only correct after [`WavSink::finalize`]; a
/// file without a finalize must be treated as incomplete.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
}

impl WavSink {
    /// Create the file and write a 16-bit PCM header.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32, channels: u16) -> Result<Self> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        Ok(Self {
            writer: Some(writer),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, samples: &[i16]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(AudioError::SinkFinalized)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        Ok(())
    }

    /// Flush remaining samples and rewrite the RIFF size fields.
    pub fn finalize(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => {
                writer.finalize()?;
                Ok(())
            }
            None => Err(AudioError::SinkFinalized),
        }
    }
}
