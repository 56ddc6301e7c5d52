//! Data sources
//!
//! An [`AudioSource`] is what the mixing engine pulls frames from. The
//! runtime's sources are all a [`DecodingSource`]: a [`Decoder`] fed with
//! coded blocks by a [`BlockFeed`]. Streamed files use a [`ChunkFeed`] over
//! the chunk cache, resident files a [`ResidentFeed`] over a shared buffer.
//!
//! Reads never block. When the decoder has nothing ready the source
//! returns what it has with [`ReadStatus::Busy`] and the engine retries on
//! its next block.

mod buffer;
mod streaming;

pub use buffer::ResidentFeed;
pub use streaming::ChunkFeed;

use crate::decode::{Decoder, InputBuffer, OutputBuffer};
use crate::sync::try_lock;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Source backed by the chunk cache
pub type StreamingSource = DecodingSource<ChunkFeed>;
/// Source backed by a resident buffer
pub type BufferSource = DecodingSource<ResidentFeed>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Every requested frame was delivered
    Ready,
    /// Data not available yet; retry later
    Busy,
    /// No more frames
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    pub frames: usize,
    pub status: ReadStatus,
}

/// Pull source of interleaved f32 frames
pub trait AudioSource: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Length in source frames
    fn length_frames(&self) -> u64;

    /// Read up to `frames` frames into `out` (`frames * channels` samples)
    fn read(&mut self, out: &mut [f32], frames: usize) -> ReadResult;

    /// Continue reading from source frame `frame`; `false` if out of range
    /// or not possible right now
    fn seek(&mut self, frame: u64) -> bool;

    /// A background decode job still references this source's buffers
    fn decode_in_flight(&self) -> bool {
        false
    }
}

/// Outcome of asking a feed for its next block
#[derive(Debug)]
pub enum FeedPoll {
    /// Next block and whether it is the last one
    Block(InputBuffer, bool),
    /// Block not read yet
    Pending,
    /// Every block has been handed out
    Exhausted,
}

/// Supplies coded blocks in file order
pub trait BlockFeed: Send {
    fn next_block(&mut self) -> FeedPoll;

    /// The oldest `count` handed-out blocks are no longer needed
    fn release_blocks(&mut self, count: usize);

    /// Drop every held block and continue from the block containing `byte`.
    ///
    /// # Returns
    /// The byte offset the feed actually restarts at (block aligned)
    fn restart(&mut self, byte: u64) -> u64;
}

/// A decoder driven by a block feed
pub struct DecodingSource<F: BlockFeed> {
    feed: F,
    decoder: Decoder,
    channels: usize,
    sample_rate: u32,
    frame_count: u64,
    /// Fixed PCM frame size; `None` for compressed formats
    bytes_per_frame: Option<usize>,
    /// Block taken from the feed but not accepted by the decoder yet
    staged: Option<(InputBuffer, bool)>,
    feed_done: bool,
    output: Option<OutputBuffer>,
    /// Sample position inside `output`
    output_pos: usize,
    /// Frames delivered (or skipped to) so far
    position: u64,
    /// Decoded frames to discard after a seek
    skip: u64,
}

impl<F: BlockFeed> DecodingSource<F> {
    /// # Arguments
    /// - `frame_count`: length in source frames; decoding stops there
    /// - `bytes_per_frame`: PCM frame size, enables byte-offset seeking
    pub fn new(
        feed: F,
        decoder: Decoder,
        channels: usize,
        sample_rate: u32,
        frame_count: u64,
        bytes_per_frame: Option<usize>,
    ) -> Self {
        Self {
            feed,
            decoder,
            channels: channels.max(1),
            sample_rate,
            frame_count,
            bytes_per_frame,
            staged: None,
            feed_done: false,
            output: None,
            output_pos: 0,
            position: 0,
            skip: 0,
        }
    }

    /// Source frame the next read starts at
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Abandon queued decode work; the feed keeps its blocks until drop
    pub fn flush(&mut self) {
        self.decoder.flush();
        self.output = None;
        self.staged = None;
    }

    /// Hand as many blocks to the decoder as it accepts
    fn pump_input(&mut self) {
        loop {
            if self.staged.is_none() && !self.feed_done {
                match self.feed.next_block() {
                    FeedPoll::Block(block, is_last) => self.staged = Some((block, is_last)),
                    FeedPoll::Pending => {}
                    FeedPoll::Exhausted => self.feed_done = true,
                }
            }
            let Some((block, is_last)) = self.staged.take() else {
                return;
            };
            if !self.decoder.queue_input(block.clone(), is_last) {
                self.staged = Some((block, is_last));
                return;
            }
            if is_last {
                self.feed_done = true;
            }
        }
    }

    fn release_consumed(&mut self) {
        let consumed = self.decoder.release_consumed_inputs();
        if consumed > 0 {
            self.feed.release_blocks(consumed);
        }
    }
}

impl<F: BlockFeed> AudioSource for DecodingSource<F> {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_frames(&self) -> u64 {
        self.frame_count
    }

    fn read(&mut self, out: &mut [f32], frames: usize) -> ReadResult {
        let ch = self.channels;
        let frames = frames.min(out.len() / ch);
        let mut done = 0usize;

        while done < frames {
            if self.position >= self.frame_count {
                return ReadResult {
                    frames: done,
                    status: ReadStatus::End,
                };
            }

            if let Some(output) = &self.output {
                let available = (output.sample_count().saturating_sub(self.output_pos)) / ch;
                if available > 0 {
                    if self.skip > 0 {
                        let n = (available as u64).min(self.skip) as usize;
                        self.output_pos += n * ch;
                        self.skip -= n as u64;
                        continue;
                    }
                    let n = available
                        .min(frames - done)
                        .min((self.frame_count - self.position) as usize);
                    output.copy_to(self.output_pos, &mut out[done * ch..(done + n) * ch]);
                    self.output_pos += n * ch;
                    self.position += n as u64;
                    done += n;
                    continue;
                }
            }

            self.pump_input();
            let previous = self.output.take();
            let next = self.decoder.next_output(previous);
            self.release_consumed();
            match next {
                Some(output) => {
                    self.output = Some(output);
                    self.output_pos = 0;
                }
                None => {
                    if self.feed_done && self.staged.is_none() && self.decoder.is_drained() {
                        trace!("Source ended early at frame {}", self.position);
                        self.position = self.frame_count;
                        return ReadResult {
                            frames: done,
                            status: ReadStatus::End,
                        };
                    }
                    return ReadResult {
                        frames: done,
                        status: ReadStatus::Busy,
                    };
                }
            }
        }

        ReadResult {
            frames: done,
            status: ReadStatus::Ready,
        }
    }

    fn seek(&mut self, frame: u64) -> bool {
        if frame >= self.frame_count {
            return false;
        }
        self.flush();
        self.output_pos = 0;
        self.feed_done = false;
        self.position = frame;

        match self.bytes_per_frame.filter(|_| self.decoder.supports_byte_seek()) {
            Some(bytes_per_frame) => {
                let byte = frame * bytes_per_frame as u64;
                let at = self.feed.restart(byte);
                self.skip = (byte - at.min(byte)) / bytes_per_frame as u64;
            }
            None => {
                // Decode from the top and discard up to the target
                self.feed.restart(0);
                self.skip = frame;
            }
        }
        trace!("Source seek to frame {} (skip {})", frame, self.skip);
        true
    }

    fn decode_in_flight(&self) -> bool {
        self.decoder.is_running()
    }
}

/// Engine-side view of a pooled source.
///
/// The pool keeps the other reference so it can check for in-flight decode
/// work before reclaiming the source. Access from the engine only ever
/// `try_lock`s; a held lock reads as busy.
pub struct PooledSource<S: AudioSource> {
    inner: Arc<Mutex<S>>,
    channels: usize,
    sample_rate: u32,
    length: u64,
}

impl<S: AudioSource> PooledSource<S> {
    pub fn new(inner: Arc<Mutex<S>>) -> Self {
        let (channels, sample_rate, length) = {
            let source = crate::sync::lock(&inner);
            (source.channels(), source.sample_rate(), source.length_frames())
        };
        Self {
            inner,
            channels,
            sample_rate,
            length,
        }
    }
}

impl<S: AudioSource> AudioSource for PooledSource<S> {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_frames(&self) -> u64 {
        self.length
    }

    fn read(&mut self, out: &mut [f32], frames: usize) -> ReadResult {
        match try_lock(&self.inner) {
            Some(mut source) => source.read(out, frames),
            None => ReadResult {
                frames: 0,
                status: ReadStatus::Busy,
            },
        }
    }

    fn seek(&mut self, frame: u64) -> bool {
        try_lock(&self.inner).is_some_and(|mut source| source.seek(frame))
    }

    fn decode_in_flight(&self) -> bool {
        try_lock(&self.inner).map_or(true, |source| source.decode_in_flight())
    }
}
