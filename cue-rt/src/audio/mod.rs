//! Audio plumbing: device output, the mixer-to-device ring and streaming
//! sample-rate conversion

pub mod output;
pub mod resampler;
pub mod ring_buffer;

pub use output::AudioOutput;
pub use resampler::StreamResampler;
pub use ring_buffer::{AudioConsumer, AudioProducer, AudioRingBuffer, StereoFrame};
