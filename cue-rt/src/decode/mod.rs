//! Pull decoders
//!
//! Every decoder follows one contract:
//! - `queue_input(buffer, is_last)` hands over a block of coded bytes
//! - `next_output(previous)` gives back the previous output and returns the
//!   next one, or `None` when nothing is decoded yet
//! - `release_consumed_inputs()` reports how many queued inputs the decoder
//!   no longer needs (the caller frees their backing storage in order)
//! - `is_running()` is true while background work is in flight
//! - `flush()` abandons queued and decoded data
//!
//! None of these block on decode work, so they are safe on the audio path.

mod mp3;
pub mod mp3_frame;
mod pcm;

pub use mp3::Mp3Decoder;
pub use pcm::PcmDecoder;

use cue_common::bank::CodingFormat;
use std::sync::Arc;

/// Block of coded bytes: a window into shared storage
#[derive(Debug, Clone)]
pub struct InputBuffer {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl InputBuffer {
    /// Window `[start, end)` of `data`, clamped to its length
    pub fn new(data: Arc<[u8]>, start: usize, end: usize) -> Self {
        let end = end.min(data.len());
        let start = start.min(end);
        Self { data, start, end }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The same window with its first `n` bytes dropped
    pub(crate) fn skip(&self, n: usize) -> Self {
        Self::new(Arc::clone(&self.data), self.start + n, self.end)
    }
}

/// Sample encoding of raw PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmFormat {
    S16,
    F32,
}

impl PcmFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PcmFormat::S16 => 2,
            PcmFormat::F32 => 4,
        }
    }
}

/// Decoded block
#[derive(Debug)]
pub enum OutputBuffer {
    /// Raw PCM bytes, passed through from the input
    Pcm { input: InputBuffer, format: PcmFormat },
    /// Interleaved float samples
    Samples(Vec<f32>),
}

impl OutputBuffer {
    /// Number of interleaved samples in the block
    pub fn sample_count(&self) -> usize {
        match self {
            OutputBuffer::Pcm { input, format } => input.len() / format.bytes_per_sample(),
            OutputBuffer::Samples(samples) => samples.len(),
        }
    }

    /// Sample `index` as f32
    pub fn sample(&self, index: usize) -> f32 {
        match self {
            OutputBuffer::Pcm { input, format } => {
                let bytes = input.bytes();
                match format {
                    PcmFormat::S16 => {
                        let at = index * 2;
                        i16::from_le_bytes([bytes[at], bytes[at + 1]]) as f32 / 32_768.0
                    }
                    PcmFormat::F32 => {
                        let at = index * 4;
                        f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
                    }
                }
            }
            OutputBuffer::Samples(samples) => samples[index],
        }
    }

    /// Copy samples `[from, from + out.len())` into `out`
    pub fn copy_to(&self, from: usize, out: &mut [f32]) {
        match self {
            OutputBuffer::Samples(samples) => {
                out.copy_from_slice(&samples[from..from + out.len()]);
            }
            OutputBuffer::Pcm { .. } => {
                for (i, o) in out.iter_mut().enumerate() {
                    *o = self.sample(from + i);
                }
            }
        }
    }
}

/// The fixed set of decoders
pub enum Decoder {
    Pcm(PcmDecoder),
    Mp3(Mp3Decoder),
}

impl Decoder {
    /// `true` if another input can be queued now
    pub fn can_queue_input(&self) -> bool {
        match self {
            Decoder::Pcm(d) => d.can_queue_input(),
            Decoder::Mp3(d) => d.can_queue_input(),
        }
    }

    /// Queue an input block; `false` (input dropped) when full
    pub fn queue_input(&mut self, input: InputBuffer, is_last: bool) -> bool {
        match self {
            Decoder::Pcm(d) => d.queue_input(input, is_last),
            Decoder::Mp3(d) => d.queue_input(input, is_last),
        }
    }

    pub fn next_output(&mut self, previous: Option<OutputBuffer>) -> Option<OutputBuffer> {
        match self {
            Decoder::Pcm(d) => d.next_output(previous),
            Decoder::Mp3(d) => d.next_output(previous),
        }
    }

    pub fn release_consumed_inputs(&mut self) -> usize {
        match self {
            Decoder::Pcm(d) => d.release_consumed_inputs(),
            Decoder::Mp3(d) => d.release_consumed_inputs(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Decoder::Pcm(_) => false,
            Decoder::Mp3(d) => d.is_running(),
        }
    }

    /// Nothing queued, nothing decoded, nothing in flight
    pub fn is_drained(&self) -> bool {
        match self {
            Decoder::Pcm(d) => d.is_drained(),
            Decoder::Mp3(d) => d.is_drained(),
        }
    }

    pub fn flush(&mut self) {
        match self {
            Decoder::Pcm(d) => d.flush(),
            Decoder::Mp3(d) => d.flush(),
        }
    }

    /// Seeking by byte offset is only possible for fixed-size PCM frames
    pub fn supports_byte_seek(&self) -> bool {
        matches!(self, Decoder::Pcm(_))
    }
}

/// PCM sample format for a bank coding format
pub fn pcm_format(format: CodingFormat) -> Option<PcmFormat> {
    match format {
        CodingFormat::PcmS16 => Some(PcmFormat::S16),
        CodingFormat::PcmF32 => Some(PcmFormat::F32),
        CodingFormat::Mp3 => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_window_clamped() {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 10]);
        let input = InputBuffer::new(Arc::clone(&data), 4, 50);
        assert_eq!(input.len(), 6);
        let empty = InputBuffer::new(data, 12, 50);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_pcm_sample_conversion() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&i16::MIN.to_le_bytes());
        bytes.extend_from_slice(&16_384i16.to_le_bytes());
        let out = OutputBuffer::Pcm {
            input: InputBuffer::new(Arc::from(bytes), 0, 4),
            format: PcmFormat::S16,
        };
        assert_eq!(out.sample_count(), 2);
        assert_eq!(out.sample(0), -1.0);
        assert_eq!(out.sample(1), 0.5);

        let f = OutputBuffer::Pcm {
            input: InputBuffer::new(Arc::from(0.25f32.to_le_bytes().to_vec()), 0, 4),
            format: PcmFormat::F32,
        };
        let mut out = [0.0f32; 1];
        f.copy_to(0, &mut out);
        assert_eq!(out[0], 0.25);
    }
}
