//! Stateful polyphase resampling for variable-size frame streams.

use rubato::{FftFixedIn, Resampler};

use crate::Result;

const CHUNK_SIZE: usize = 256;
const SUB_CHUNKS: usize = 2;

/// Wraps a rubato FFT resampler and buffers input so callers can feed
/// frames of arbitrary length. Samples that don't fill a whole chunk stay
/// buffered until the next call.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    input_buffer: Vec<f32>,
    from_rate: u32,
    to_rate: u32,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            CHUNK_SIZE,
            SUB_CHUNKS,
            1,
        )?;

        Ok(Self {
            resampler,
            input_buffer: Vec::with_capacity(CHUNK_SIZE * 2),
            from_rate,
            to_rate,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Feed mono samples; returns whatever full chunks produced.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.input_buffer.extend_from_slice(samples);

        let mut output = Vec::new();
        while self.input_buffer.len() >= CHUNK_SIZE {
            let chunk: Vec<f32> = self.input_buffer.drain(..CHUNK_SIZE).collect();
            let resampled = self.resampler.process(&[chunk], None)?;
            if let Some(channel) = resampled.into_iter().next() {
                output.extend_from_slice(&channel);
            }
        }

        Ok(output)
    }
}
