//! Lock-free ring buffer between the mixer thread and the device callback
//!
//! The mixer thread renders the engine in blocks and pushes stereo frames;
//! the cpal callback pops them without taking any lock. An empty ring plays
//! silence and counts an underrun.

use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Ring size when none is configured (~85ms @ 48kHz)
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// One interleaved stereo frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StereoFrame {
    pub left: f32,
    pub right: f32,
}

impl StereoFrame {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_stereo(left: f32, right: f32) -> Self {
        Self { left, right }
    }
}

pub struct AudioRingBuffer {
    buffer: HeapRb<StereoFrame>,
    underruns: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
}

impl AudioRingBuffer {
    /// # Arguments
    /// * `capacity` - Buffer size in frames (default 4096)
    pub fn new(capacity: Option<usize>) -> Self {
        let capacity = capacity.unwrap_or(DEFAULT_BUFFER_SIZE);
        debug!("Creating audio ring buffer with capacity: {} frames", capacity);
        Self {
            buffer: HeapRb::new(capacity),
            underruns: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Split into the mixer-thread producer and the callback consumer
    pub fn split(self) -> (AudioProducer, AudioConsumer) {
        let (prod, cons) = self.buffer.split();
        (
            AudioProducer {
                producer: prod,
                overruns: Arc::clone(&self.overruns),
                underruns: Arc::clone(&self.underruns),
            },
            AudioConsumer {
                consumer: cons,
                underruns: Arc::clone(&self.underruns),
            },
        )
    }
}

pub struct AudioProducer {
    producer: ringbuf::HeapProd<StereoFrame>,
    overruns: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
}

impl AudioProducer {
    /// Push interleaved stereo samples.
    ///
    /// Returns the number of frames pushed; the rest is dropped as overrun.
    pub fn push_interleaved(&mut self, samples: &[f32]) -> usize {
        let mut pushed = 0;
        for pair in samples.chunks_exact(2) {
            if self
                .producer
                .try_push(StereoFrame::from_stereo(pair[0], pair[1]))
                .is_err()
            {
                let count = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    warn!("Audio ring buffer overrun (total: {})", count);
                }
                break;
            }
            pushed += 1;
        }
        pushed
    }

    /// Frames that fit before the ring is full
    pub fn vacant_len(&self) -> usize {
        self.producer.vacant_len()
    }

    /// Silent frames the device has played so far
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

pub struct AudioConsumer {
    consumer: ringbuf::HeapCons<StereoFrame>,
    underruns: Arc<AtomicU64>,
}

impl AudioConsumer {
    /// Next frame, or silence on underrun
    pub fn pop(&mut self) -> StereoFrame {
        match self.consumer.try_pop() {
            Some(frame) => frame,
            None => {
                let count = self.underruns.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    trace!("Audio ring buffer underrun (total: {})", count);
                }
                StereoFrame::zero()
            }
        }
    }
}
