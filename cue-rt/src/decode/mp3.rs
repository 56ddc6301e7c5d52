//! Job-driven MP3 decoder
//!
//! Decoding runs as a background job launched through the [`JobExecutor`].
//! The caller-facing methods only ever `try_lock` the shared state, and the
//! job holds that lock just long enough to take work out and put results
//! back, so nothing on the audio path waits for a frame to decode.
//!
//! Input blocks rarely end on a frame boundary. The undecoded tail of each
//! block is copied into a carry buffer and prepended to the next block.
//! Decoded samples go into at most `max_outputs` buffers; when they are all
//! waiting for the reader the job stops mid-block and puts the rest of the
//! block back at the head of the input queue, so a block only counts as
//! consumed once every frame in it has been decoded. Flushing bumps an
//! epoch; a job that finishes work from an older epoch throws it away.

use super::mp3_frame::{id3v2_len, scan_header, Scan};
use super::{InputBuffer, OutputBuffer};
use crate::error::{Error, Result};
use crate::jobs::JobExecutor;
use crate::sync::{lock, try_lock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use tracing::{debug, trace, warn};

/// Inputs held at once: the block being decoded and one behind it
const MAX_PENDING_INPUTS: usize = 2;
/// Samples per channel in the largest MPEG audio frame
const MAX_FRAME_SAMPLES: usize = 1152;

struct Mp3State {
    epoch: u64,
    inputs: VecDeque<(InputBuffer, bool)>,
    ready: VecDeque<Vec<f32>>,
    free: Vec<Vec<f32>>,
    consumed: usize,
    /// Taken by the job while it decodes
    codec: Option<Box<dyn CodecDecoder>>,
    sample_buf: Option<SampleBuffer<f32>>,
    carry: Vec<u8>,
    /// Output being filled across blocks
    partial: Vec<f32>,
    partial_frames: usize,
    /// ID3 bytes still to skip when a tag spans blocks
    id3_skip: usize,
    at_stream_start: bool,
    timestamp: u64,
}

impl Mp3State {
    fn has_work(&self, max_outputs: usize) -> bool {
        !self.inputs.is_empty() && self.ready.len() < max_outputs && self.codec.is_some()
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.inputs.clear();
        while let Some(mut buf) = self.ready.pop_front() {
            buf.clear();
            self.free.push(buf);
        }
        self.consumed = 0;
        self.carry.clear();
        self.partial.clear();
        self.partial_frames = 0;
        self.id3_skip = 0;
        self.at_stream_start = true;
        self.timestamp = 0;
        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
    }
}

struct Mp3Shared {
    state: Mutex<Mp3State>,
    running: AtomicBool,
    shutdown: AtomicBool,
    channels: usize,
    max_outputs: usize,
    frames_per_output: usize,
}

/// Work taken out of the shared state for one input block
struct Work {
    epoch: u64,
    input: InputBuffer,
    is_last: bool,
    codec: Box<dyn CodecDecoder>,
    sample_buf: Option<SampleBuffer<f32>>,
    carry: Vec<u8>,
    partial: Vec<f32>,
    partial_frames: usize,
    id3_skip: usize,
    at_stream_start: bool,
    timestamp: u64,
    free: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
    /// Ready outputs when the work was taken; the reader only shrinks it
    ready_base: usize,
    /// Undecoded rest of `input` when the ring filled up
    rest: Option<InputBuffer>,
}

pub struct Mp3Decoder {
    shared: Arc<Mp3Shared>,
    jobs: Arc<dyn JobExecutor>,
    /// Outputs handed back while the state was locked by the job
    returned: Vec<Vec<f32>>,
}

impl Mp3Decoder {
    /// # Arguments
    /// - `channels`: channel count of the produced samples (decoded frames
    ///   are remapped to it)
    /// - `max_outputs`: decoded buffers kept ahead of the reader
    /// - `frames_per_output`: MPEG frames per output buffer
    pub fn new(
        sample_rate: u32,
        channels: usize,
        jobs: Arc<dyn JobExecutor>,
        max_outputs: usize,
        frames_per_output: usize,
    ) -> Result<Self> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3).with_sample_rate(sample_rate);
        let codec = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create MP3 decoder: {}", e)))?;

        let state = Mp3State {
            epoch: 0,
            inputs: VecDeque::with_capacity(MAX_PENDING_INPUTS),
            ready: VecDeque::with_capacity(max_outputs),
            free: (0..max_outputs.max(1))
                .map(|_| Vec::with_capacity(frames_per_output.max(1) * MAX_FRAME_SAMPLES * channels.max(1)))
                .collect(),
            consumed: 0,
            codec: Some(codec),
            sample_buf: None,
            carry: Vec::new(),
            partial: Vec::new(),
            partial_frames: 0,
            id3_skip: 0,
            at_stream_start: true,
            timestamp: 0,
        };

        Ok(Self {
            shared: Arc::new(Mp3Shared {
                state: Mutex::new(state),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                channels: channels.max(1),
                max_outputs: max_outputs.max(1),
                frames_per_output: frames_per_output.max(1),
            }),
            jobs,
            returned: Vec::new(),
        })
    }

    pub fn can_queue_input(&self) -> bool {
        try_lock(&self.shared.state).is_some_and(|st| st.inputs.len() < MAX_PENDING_INPUTS)
    }

    pub fn queue_input(&mut self, input: InputBuffer, is_last: bool) -> bool {
        let kick = {
            let Some(mut st) = try_lock(&self.shared.state) else {
                return false;
            };
            if st.inputs.len() >= MAX_PENDING_INPUTS {
                return false;
            }
            st.inputs.push_back((input, is_last));
            st.has_work(self.shared.max_outputs)
        };
        if kick {
            self.kick();
        }
        true
    }

    pub fn next_output(&mut self, previous: Option<OutputBuffer>) -> Option<OutputBuffer> {
        if let Some(OutputBuffer::Samples(buf)) = previous {
            self.returned.push(buf);
        }

        let (output, kick) = {
            let mut st = try_lock(&self.shared.state)?;
            for mut buf in self.returned.drain(..) {
                buf.clear();
                st.free.push(buf);
            }
            let output = st.ready.pop_front();
            (output, st.has_work(self.shared.max_outputs))
        };
        if kick {
            self.kick();
        }
        output.map(OutputBuffer::Samples)
    }

    pub fn release_consumed_inputs(&mut self) -> usize {
        try_lock(&self.shared.state).map_or(0, |mut st| std::mem::take(&mut st.consumed))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_drained(&self) -> bool {
        if self.is_running() {
            return false;
        }
        try_lock(&self.shared.state)
            .is_some_and(|st| st.inputs.is_empty() && st.ready.is_empty() && st.partial.is_empty())
    }

    /// Drop queued input, decoded output and carried bytes.
    ///
    /// A job still in flight finishes its current block and discards it;
    /// poll [`is_running`](Self::is_running) before tearing down.
    pub fn flush(&mut self) {
        let mut st = lock(&self.shared.state);
        st.reset();
        for mut buf in self.returned.drain(..) {
            buf.clear();
            st.free.push(buf);
        }
        trace!("MP3 decoder flushed (epoch {})", st.epoch);
    }

    fn kick(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        if !self.jobs.launch(Box::new(move || run_job(shared))) {
            warn!("Decode job rejected by executor");
            self.shared.running.store(false, Ordering::Release);
        }
    }
}

impl Drop for Mp3Decoder {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

fn run_job(shared: Arc<Mp3Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let work = take_work(&shared);
        let Some(mut work) = work else {
            shared.running.store(false, Ordering::Release);
            // Work may have been queued between the check and the store
            let more = lock(&shared.state).has_work(shared.max_outputs);
            if more && !shared.running.swap(true, Ordering::AcqRel) {
                continue;
            }
            return;
        };

        decode_block(&shared, &mut work);
        commit(&shared, work);
    }
    shared.running.store(false, Ordering::Release);
}

fn take_work(shared: &Mp3Shared) -> Option<Work> {
    let mut st = lock(&shared.state);
    if !st.has_work(shared.max_outputs) {
        return None;
    }
    let (input, is_last) = st.inputs.pop_front()?;
    let codec = st.codec.take()?;
    Some(Work {
        epoch: st.epoch,
        input,
        is_last,
        codec,
        sample_buf: st.sample_buf.take(),
        carry: std::mem::take(&mut st.carry),
        partial: std::mem::take(&mut st.partial),
        partial_frames: st.partial_frames,
        id3_skip: st.id3_skip,
        at_stream_start: st.at_stream_start,
        timestamp: st.timestamp,
        free: std::mem::take(&mut st.free),
        outputs: Vec::new(),
        ready_base: st.ready.len(),
        rest: None,
    })
}

fn commit(shared: &Mp3Shared, mut work: Work) {
    let mut st = lock(&shared.state);
    if st.epoch != work.epoch {
        trace!("Discarding MP3 work from flushed epoch {}", work.epoch);
        work.codec.reset();
        st.codec = Some(work.codec);
        st.sample_buf = work.sample_buf;
        for mut buf in work.outputs.into_iter().chain(work.free) {
            buf.clear();
            st.free.push(buf);
        }
        return;
    }

    match work.rest.take() {
        Some(rest) => st.inputs.push_front((rest, work.is_last)),
        None => st.consumed += 1,
    }
    st.codec = Some(work.codec);
    st.sample_buf = work.sample_buf;
    st.carry = work.carry;
    st.partial = work.partial;
    st.partial_frames = work.partial_frames;
    st.id3_skip = work.id3_skip;
    st.at_stream_start = work.at_stream_start;
    st.timestamp = work.timestamp;
    st.ready.extend(work.outputs);
    st.free.append(&mut work.free);
}

/// Decode whole frames of carry + input until the input runs out or the
/// output ring is full; keep whatever is left for later
fn decode_block(shared: &Mp3Shared, work: &mut Work) {
    let mut data = std::mem::take(&mut work.carry);
    let carry_len = data.len();
    data.extend_from_slice(work.input.bytes());
    let mut pos = 0usize;

    if work.id3_skip > 0 {
        let n = work.id3_skip.min(data.len());
        pos += n;
        work.id3_skip -= n;
    }
    if work.at_stream_start && work.id3_skip == 0 && data.len() - pos >= 10 {
        if let Some(tag_len) = id3v2_len(&data[pos..]) {
            let n = tag_len.min(data.len() - pos);
            pos += n;
            work.id3_skip = tag_len - n;
            debug!("Skipping {} byte ID3v2 tag", tag_len);
        }
        work.at_stream_start = false;
    }

    while work.id3_skip == 0 && !shared.shutdown.load(Ordering::Relaxed) {
        if work.ready_base + work.outputs.len() >= shared.max_outputs {
            trace!("MP3 output ring full, pausing at byte {}", pos);
            if pos < carry_len {
                data.truncate(carry_len);
                data.drain(..pos);
                work.carry = data;
                work.rest = Some(work.input.clone());
            } else {
                work.rest = Some(work.input.skip(pos - carry_len));
            }
            return;
        }
        match scan_header(&data[pos..]) {
            Scan::NeedMore => break,
            Scan::NoSync => pos += 1,
            Scan::Frame(header) => {
                if pos + header.frame_len > data.len() {
                    break;
                }
                decode_frame(
                    shared,
                    work,
                    &data[pos..pos + header.frame_len],
                    header.samples_per_frame,
                );
                pos += header.frame_len;
            }
        }
    }

    if work.is_last {
        if !work.partial.is_empty() {
            let full = std::mem::take(&mut work.partial);
            work.outputs.push(full);
            work.partial_frames = 0;
        }
    } else {
        let mut carry = data;
        carry.drain(..pos.min(carry.len()));
        work.carry = carry;
    }
}

fn decode_frame(shared: &Mp3Shared, work: &mut Work, frame: &[u8], samples_per_frame: usize) {
    let packet = Packet::new_from_slice(0, work.timestamp, samples_per_frame as u64, frame);
    work.timestamp += samples_per_frame as u64;

    let decoded = match work.codec.decode(&packet) {
        Ok(decoded) => decoded,
        Err(SymphoniaError::DecodeError(e)) => {
            debug!("Skipping undecodable MP3 frame: {}", e);
            return;
        }
        Err(e) => {
            warn!("MP3 decode failed: {}", e);
            return;
        }
    };
    if decoded.frames() == 0 {
        return;
    }

    let spec = *decoded.spec();
    let needed = decoded.capacity() as u64;
    let fits = work
        .sample_buf
        .as_ref()
        .is_some_and(|buf| buf.capacity() >= needed as usize * spec.channels.count());
    if !fits {
        work.sample_buf = Some(SampleBuffer::<f32>::new(needed, spec));
    }
    let Some(sample_buf) = work.sample_buf.as_mut() else {
        return;
    };
    sample_buf.copy_interleaved_ref(decoded);

    if work.partial.is_empty() {
        if let Some(buf) = work.free.pop() {
            work.partial = buf;
        }
    }
    push_mapped(
        &mut work.partial,
        sample_buf.samples(),
        spec.channels.count(),
        shared.channels,
    );
    work.partial_frames += 1;

    if work.partial_frames >= shared.frames_per_output {
        let full = std::mem::take(&mut work.partial);
        work.outputs.push(full);
        work.partial_frames = 0;
    }
}

/// Append interleaved `src` with `src_channels` as `dst_channels`
fn push_mapped(dst: &mut Vec<f32>, src: &[f32], src_channels: usize, dst_channels: usize) {
    if src_channels == dst_channels || src_channels == 0 {
        dst.extend_from_slice(src);
        return;
    }
    for frame in src.chunks_exact(src_channels) {
        if src_channels == 1 {
            dst.extend(std::iter::repeat(frame[0]).take(dst_channels));
        } else if dst_channels == 1 {
            dst.push(frame.iter().sum::<f32>() / src_channels as f32);
        } else {
            for c in 0..dst_channels {
                dst.push(frame[c.min(src_channels - 1)]);
            }
        }
    }
}
