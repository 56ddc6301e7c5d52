//! Streaming sample-rate conversion using rubato
//!
//! Files whose rate differs from the output rate are converted block by
//! block as the engine pulls them. Input accumulates until the resampler's
//! next chunk is complete; converted frames wait in an interleaved queue.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use std::collections::VecDeque;
use tracing::debug;

/// Input frames per conversion chunk
pub const DEFAULT_CHUNK_FRAMES: usize = 256;

pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    ratio: f64,
    channels: usize,
    /// Planar input waiting for a full chunk
    input: Vec<Vec<f32>>,
    /// Interleaved converted frames
    output: VecDeque<f32>,
}

impl StreamResampler {
    /// # Arguments
    /// - `input_rate`, `output_rate`: sample rates in Hz
    /// - `channels`: interleaved channel count
    /// - `chunk_frames`: input frames per conversion
    pub fn new(input_rate: u32, output_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let channels = channels.max(1);
        let inner = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            chunk_frames,
            channels,
        )
        .map_err(|e| Error::Decode(format!("Failed to create resampler: {}", e)))?;

        debug!(
            "Stream resampler {}Hz -> {}Hz ({} channels)",
            input_rate, output_rate, channels
        );

        Ok(Self {
            inner,
            ratio: output_rate as f64 / input_rate as f64,
            channels,
            input: vec![Vec::with_capacity(chunk_frames); channels],
            output: VecDeque::new(),
        })
    }

    /// Input frames still needed to complete the next chunk
    pub fn input_frames_needed(&self) -> usize {
        self.inner
            .input_frames_next()
            .saturating_sub(self.input[0].len())
    }

    /// Converted frames ready to pop
    pub fn available_frames(&self) -> usize {
        self.output.len() / self.channels
    }

    /// Append interleaved input; converts every completed chunk
    pub fn push_interleaved(&mut self, samples: &[f32]) {
        for frame in samples.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.input[ch].push(*sample);
            }
            if self.input[0].len() >= self.inner.input_frames_next() {
                self.convert(false);
            }
        }
    }

    /// Convert whatever input is left as a final, partial chunk
    pub fn finish(&mut self) {
        if !self.input[0].is_empty() {
            self.convert(true);
        }
    }

    /// Pop up to `out.len() / channels` interleaved frames
    pub fn pop_interleaved(&mut self, out: &mut [f32]) -> usize {
        let frames = (out.len() / self.channels).min(self.available_frames());
        for (o, s) in out.iter_mut().zip(self.output.drain(..frames * self.channels)) {
            *o = s;
        }
        frames
    }

    /// Forget buffered input and output
    pub fn reset(&mut self) {
        self.inner.reset();
        self.input.iter_mut().for_each(Vec::clear);
        self.output.clear();
    }

    fn convert(&mut self, partial: bool) {
        let result = if partial {
            // Zero padding fills the chunk; keep only the part the real input covers
            let keep = (self.input[0].len() as f64 * self.ratio).round() as usize;
            self.inner
                .process_partial(Some(self.input.as_slice()), None)
                .map(|mut planar| {
                    planar.iter_mut().for_each(|ch| ch.truncate(keep));
                    planar
                })
        } else {
            self.inner.process(&self.input, None)
        };
        match result {
            Ok(planar) => interleave_into(&planar, &mut self.output),
            Err(e) => debug!("Resampling chunk dropped: {}", e),
        }
        self.input.iter_mut().for_each(Vec::clear);
    }
}

/// Convert planar samples to interleaved format.
///
/// Input:  [[L, L, L, ...], [R, R, R, ...]]
/// Output: [L, R, L, R, L, R, ...]
fn interleave_into(planar: &[Vec<f32>], out: &mut VecDeque<f32>) {
    let Some(first) = planar.first() else {
        return;
    };
    for frame_idx in 0..first.len() {
        for channel in planar {
            out.push_back(channel[frame_idx]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_into() {
        let planar = vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0, 6.0]];
        let mut out = VecDeque::new();
        interleave_into(&planar, &mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_upsample_ratio() {
        let mut rs = StreamResampler::new(24_000, 48_000, 2, 256).unwrap();
        let input: Vec<f32> = (0..2400 * 2).map(|i| ((i / 2) as f32 * 0.01).sin() * 0.5).collect();
        rs.push_interleaved(&input);
        rs.finish();

        let mut out = vec![0.0f32; 10_000 * 2];
        let frames = rs.pop_interleaved(&mut out);
        // Output should be roughly twice the input length
        assert!(
            (4700..=4900).contains(&frames),
            "Expected ~4800 frames, got {}",
            frames
        );
        assert_eq!(rs.available_frames(), 0);
    }

    #[test]
    fn test_needs_input_until_chunk_full() {
        let mut rs = StreamResampler::new(44_100, 48_000, 1, 128).unwrap();
        assert_eq!(rs.input_frames_needed(), 128);
        rs.push_interleaved(&[0.0; 100]);
        assert_eq!(rs.input_frames_needed(), 28);
        assert_eq!(rs.available_frames(), 0);
        rs.push_interleaved(&[0.0; 28]);
        assert!(rs.available_frames() > 0);
    }
}
