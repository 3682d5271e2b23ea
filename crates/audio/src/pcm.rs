//! Sample-format and channel-layout conversions.

use crate::DecodedFrame;

/// Collapse a decoded frame to mono.
///
/// Interleaved stereo averages each `L R` pair; planar stereo averages the
/// two half-buffers element-wise. An interleaved buffer with an odd sample
/// count cannot be true stereo and is passed through as mono.
pub fn to_mono(frame: &DecodedFrame) -> Vec<i16> {
    match (frame.channels, frame.interleaved) {
        (0 | 1, _) => frame.samples.clone(),
        (2, true) => {
            if frame.samples.len() % 2 != 0 {
                return frame.samples.clone();
            }
            frame
                .samples
                .chunks_exact(2)
                .map(|pair| (((pair[0] as i32) + (pair[1] as i32)) / 2) as i16)
                .collect()
        }
        (2, false) => {
            let half = frame.samples.len() / 2;
            let (left, right) = frame.samples.split_at(half);
            left.iter()
                .zip(right.iter())
                .map(|(&l, &r)| (((l as i32) + (r as i32)) / 2) as i16)
                .collect()
        }
        (n, true) => {
            let n = n as usize;
            if frame.samples.len() % n != 0 {
                return frame.samples.clone();
            }
            frame
                .samples
                .chunks_exact(n)
                .map(|group| {
                    let sum: i32 = group.iter().map(|&s| s as i32).sum();
                    (sum / n as i32) as i16
                })
                .collect()
        }
        (n, false) => {
            let n = n as usize;
            let per_channel = frame.samples.len() / n;
            (0..per_channel)
                .map(|i| {
                    let sum: i32 = (0..n)
                        .map(|ch| frame.samples[ch * per_channel + i] as i32)
                        .sum();
                    (sum / n as i32) as i16
                })
                .collect()
        }
    }
}

#[inline]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[inline]
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}
