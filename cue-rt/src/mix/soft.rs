//! Software mixing engine
//!
//! Renders every live sound into a stereo f32 block on demand. Start, stop
//! and fade times are honored to the frame; volume is the product of the
//! sound's volume, its fade envelope, its group chain and the master.
//! Sources at a different rate run through a [`StreamResampler`].
//!
//! All state sits behind one mutex. `render` holds it for one block; the
//! control thread's calls are short.

use super::{MixEngine, MixGroupId, PlayPosition, SoundDesc, SoundFilter, SoundId};
use crate::audio::resampler::{StreamResampler, DEFAULT_CHUNK_FRAMES};
use crate::source::{AudioSource, ReadStatus};
use crate::sync::lock;
use cue_common::timing::convert_frames;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Parent links followed when computing a group's volume
const MAX_GROUP_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayState {
    /// Created, never started
    Idle,
    Scheduled,
    Playing,
    Stopped,
    /// Played to the natural end
    Ended,
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    from: f32,
    to: f32,
    start: u64,
    length: u64,
}

impl Fade {
    fn gain_at(&self, t: u64) -> f32 {
        if t <= self.start {
            self.from
        } else if self.length == 0 || t >= self.start + self.length {
            self.to
        } else {
            let progress = (t - self.start) as f32 / self.length as f32;
            self.from + (self.to - self.from) * progress
        }
    }
}

struct GroupState {
    parent: Option<MixGroupId>,
    volume: f32,
}

struct SoundState {
    source: Box<dyn AudioSource>,
    channels: usize,
    source_rate: u32,
    output_rate: u32,
    group: MixGroupId,
    volume: f32,
    looping: bool,
    loop_start: u64,
    /// Resolved loop end in source frames
    loop_end: u64,
    source_length: u64,
    state: PlayState,
    start_at: u64,
    stop_at: Option<u64>,
    fade: Option<Fade>,
    /// Fade that takes over once its start frame is reached
    pending_fade: Option<Fade>,
    /// Source frames read so far in the current pass
    source_pos: u64,
    source_done: bool,
    resampler_flushed: bool,
    cursor: u64,
    elapsed: u64,
    /// File length in output frames
    length: u64,
    resampler: Option<StreamResampler>,
    filter: Option<Box<dyn SoundFilter>>,
    /// Source-channel samples
    scratch: Vec<f32>,
    /// Stereo samples of the block being rendered
    block: Vec<f32>,
}

impl SoundState {
    /// Gain of the fade envelope at `t` without advancing it
    fn envelope_at(&self, t: u64) -> f32 {
        match self.pending_fade {
            Some(pending) if t >= pending.start => pending.gain_at(t),
            _ => self.fade.map_or(1.0, |f| f.gain_at(t)),
        }
    }

    fn gain_at(&mut self, t: u64) -> f32 {
        if let Some(pending) = self.pending_fade {
            if t >= pending.start {
                self.fade = Some(pending);
                self.pending_fade = None;
            }
        }
        self.fade.map_or(1.0, |f| f.gain_at(t))
    }

    fn drained(&self) -> bool {
        self.source_done
            && self
                .resampler
                .as_ref()
                .map_or(true, |rs| self.resampler_flushed && rs.available_frames() == 0)
    }

    fn rewind(&mut self) -> bool {
        if !self.source.seek(0) {
            return false;
        }
        self.source_pos = 0;
        self.source_done = false;
        self.resampler_flushed = false;
        self.cursor = 0;
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
        true
    }

    fn wrap(&mut self) -> bool {
        if self.source.seek(self.loop_start) {
            self.source_pos = self.loop_start;
            true
        } else {
            false
        }
    }

    /// Read up to `want` source frames into `scratch`, wrapping at the loop end
    fn read_source(&mut self, want: usize) -> (usize, ReadStatus) {
        let ch = self.channels;
        if self.scratch.len() < want * ch {
            self.scratch.resize(want * ch, 0.0);
        }

        let mut got = 0usize;
        let mut empty_wraps = 0;
        while got < want {
            let limit = if self.looping {
                self.loop_end
            } else {
                self.source_length
            };
            let remaining = limit.saturating_sub(self.source_pos);
            if remaining == 0 {
                if !self.looping {
                    return (got, ReadStatus::End);
                }
                empty_wraps += 1;
                if empty_wraps > 1 {
                    return (got, ReadStatus::End);
                }
                if !self.wrap() {
                    return (got, ReadStatus::Busy);
                }
                continue;
            }

            let n = (want - got).min(remaining as usize);
            let result = self.source.read(&mut self.scratch[got * ch..(got + n) * ch], n);
            got += result.frames;
            self.source_pos += result.frames as u64;
            if result.frames > 0 {
                empty_wraps = 0;
            }
            match result.status {
                ReadStatus::Ready => {}
                ReadStatus::Busy => {
                    trace!("Source busy after {} frames", got);
                    return (got, ReadStatus::Busy);
                }
                ReadStatus::End => {
                    if !self.looping {
                        return (got, ReadStatus::End);
                    }
                    self.source_pos = limit;
                }
            }
        }
        (got, ReadStatus::Ready)
    }

    /// Fill `block[..frames * 2]`; returns frames produced
    fn pull(&mut self, frames: usize) -> usize {
        if self.block.len() < frames * 2 {
            self.block.resize(frames * 2, 0.0);
        }
        let produced = if self.resampler.is_some() {
            self.pull_resampled(frames)
        } else {
            let (got, status) = self.read_source(frames);
            map_to_stereo(&self.scratch[..got * self.channels], self.channels, &mut self.block[..got * 2]);
            if status == ReadStatus::End {
                self.source_done = true;
            }
            got
        };

        let buffered = self.resampler.as_ref().map_or(0, |rs| rs.available_frames() as u64);
        self.cursor = convert_frames(self.source_pos, self.source_rate, self.output_rate)
            .saturating_sub(buffered)
            .min(self.length);
        produced
    }

    fn pull_resampled(&mut self, frames: usize) -> usize {
        let ch = self.channels;
        let mut produced = 0usize;
        while produced < frames {
            let (available, needed) = match self.resampler.as_ref() {
                Some(rs) => (rs.available_frames(), rs.input_frames_needed().max(1)),
                None => break,
            };

            if available > 0 {
                let n = available.min(frames - produced);
                if self.scratch.len() < n * ch {
                    self.scratch.resize(n * ch, 0.0);
                }
                let got = match self.resampler.as_mut() {
                    Some(rs) => rs.pop_interleaved(&mut self.scratch[..n * ch]),
                    None => 0,
                };
                map_to_stereo(
                    &self.scratch[..got * ch],
                    ch,
                    &mut self.block[produced * 2..(produced + got) * 2],
                );
                produced += got;
                continue;
            }

            if self.source_done {
                if self.resampler_flushed {
                    break;
                }
                if let Some(rs) = self.resampler.as_mut() {
                    rs.finish();
                }
                self.resampler_flushed = true;
                continue;
            }

            let (got, status) = self.read_source(needed);
            if let Some(rs) = self.resampler.as_mut() {
                rs.push_interleaved(&self.scratch[..got * ch]);
            }
            match status {
                ReadStatus::Ready => {}
                ReadStatus::Busy => break,
                ReadStatus::End => self.source_done = true,
            }
        }
        produced
    }

    /// Mix this sound's part of the block starting at output frame `t0`
    fn render_into(&mut self, out: &mut [f32], t0: u64, frames: usize, group_gain: f32) {
        let block_end = t0 + frames as u64;

        if self.state == PlayState::Scheduled {
            if let Some(stop) = self.stop_at {
                if stop <= self.start_at && stop < block_end {
                    self.state = PlayState::Stopped;
                    self.stop_at = None;
                    return;
                }
            }
        }

        let from = match self.state {
            PlayState::Scheduled => {
                if self.start_at >= block_end {
                    return;
                }
                self.state = PlayState::Playing;
                self.start_at.saturating_sub(t0) as usize
            }
            PlayState::Playing => 0,
            _ => return,
        };

        let mut to = frames;
        let mut stopping = false;
        if let Some(stop) = self.stop_at {
            if stop < block_end {
                to = (stop.saturating_sub(t0) as usize).max(from);
                stopping = true;
            }
        }

        if to > from {
            let position = PlayPosition {
                elapsed: self.elapsed,
                cursor: self.cursor,
                looping: self.looping,
            };
            let produced = self.pull(to - from);
            if let Some(filter) = self.filter.as_mut() {
                filter.process(&mut self.block[..produced * 2], 2, position);
            }
            for i in 0..produced {
                let t = t0 + (from + i) as u64;
                let gain = self.gain_at(t) * self.volume * group_gain;
                out[(from + i) * 2] += self.block[i * 2] * gain;
                out[(from + i) * 2 + 1] += self.block[i * 2 + 1] * gain;
            }
            self.elapsed += produced as u64;
        }

        if stopping {
            self.state = PlayState::Stopped;
            self.stop_at = None;
        } else if self.drained() {
            self.state = PlayState::Ended;
        }
    }
}

/// Interleaved `channels` samples to stereo; mono is duplicated, extra
/// channels are dropped
fn map_to_stereo(src: &[f32], channels: usize, dst: &mut [f32]) {
    for (frame, out) in src.chunks_exact(channels).zip(dst.chunks_exact_mut(2)) {
        out[0] = frame[0];
        out[1] = if channels > 1 { frame[1] } else { frame[0] };
    }
}

struct MixState {
    clock: u64,
    next_id: u64,
    master: f32,
    groups: BTreeMap<u64, GroupState>,
    sounds: BTreeMap<u64, SoundState>,
}

fn group_gain(groups: &BTreeMap<u64, GroupState>, group: MixGroupId) -> f32 {
    let mut gain = 1.0;
    let mut current = Some(group);
    for _ in 0..MAX_GROUP_DEPTH {
        let Some(id) = current else {
            break;
        };
        match groups.get(&id.0) {
            Some(g) => {
                gain *= g.volume;
                current = g.parent;
            }
            None => break,
        }
    }
    gain
}

/// In-process stereo mixing engine
pub struct SoftMixEngine {
    sample_rate: u32,
    state: Mutex<MixState>,
}

impl SoftMixEngine {
    pub fn new(sample_rate: u32) -> Self {
        debug!("Software mixing engine at {} Hz", sample_rate);
        Self {
            sample_rate,
            state: Mutex::new(MixState {
                clock: 0,
                next_id: 1,
                master: 1.0,
                groups: BTreeMap::new(),
                sounds: BTreeMap::new(),
            }),
        }
    }

    /// Render the next `out.len() / 2` stereo frames and advance the clock
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = out.len() / 2;
        let mut st = lock(&self.state);
        let MixState {
            clock,
            master,
            groups,
            sounds,
            ..
        } = &mut *st;

        for sound in sounds.values_mut() {
            let gain = group_gain(groups, sound.group) * *master;
            sound.render_into(out, *clock, frames, gain);
        }
        *clock += frames as u64;
    }

    /// Live sounds
    pub fn sound_count(&self) -> usize {
        lock(&self.state).sounds.len()
    }

    /// Live groups
    pub fn group_count(&self) -> usize {
        lock(&self.state).groups.len()
    }

    fn with_sound<R>(&self, sound: SoundId, f: impl FnOnce(&mut SoundState, u64) -> R) -> Option<R> {
        let mut st = lock(&self.state);
        let clock = st.clock;
        match st.sounds.get_mut(&sound.0) {
            Some(s) => Some(f(s, clock)),
            None => {
                trace!("Unknown sound {:?}", sound);
                None
            }
        }
    }
}

impl MixEngine for SoftMixEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn time_frames(&self) -> u64 {
        lock(&self.state).clock
    }

    fn create_group(&self, parent: Option<MixGroupId>, volume: f32) -> Option<MixGroupId> {
        let mut st = lock(&self.state);
        let id = st.next_id;
        st.next_id += 1;
        st.groups.insert(id, GroupState { parent, volume });
        Some(MixGroupId(id))
    }

    fn destroy_group(&self, group: MixGroupId) {
        lock(&self.state).groups.remove(&group.0);
    }

    fn set_group_volume(&self, group: MixGroupId, volume: f32) {
        if let Some(g) = lock(&self.state).groups.get_mut(&group.0) {
            g.volume = volume.max(0.0);
        }
    }

    fn set_master_volume(&self, volume: f32) {
        lock(&self.state).master = volume.max(0.0);
    }

    fn create_sound(
        &self,
        source: Box<dyn AudioSource>,
        group: MixGroupId,
        desc: SoundDesc,
    ) -> Option<SoundId> {
        let channels = source.channels().max(1);
        let source_rate = source.sample_rate();
        let source_length = source.length_frames();
        if source_rate == 0 {
            warn!("Sound source reports a zero sample rate");
            return None;
        }

        let resampler = if source_rate != self.sample_rate {
            match StreamResampler::new(source_rate, self.sample_rate, channels, DEFAULT_CHUNK_FRAMES) {
                Ok(rs) => Some(rs),
                Err(e) => {
                    warn!("Sound not created: {}", e);
                    return None;
                }
            }
        } else {
            None
        };

        let loop_end = if desc.loop_end == 0 || desc.loop_end > source_length {
            source_length
        } else {
            desc.loop_end
        };
        let loop_start = if desc.loop_start < loop_end {
            desc.loop_start
        } else {
            0
        };

        let sound = SoundState {
            source,
            channels,
            source_rate,
            output_rate: self.sample_rate,
            group,
            volume: desc.volume,
            looping: desc.looping,
            loop_start,
            loop_end,
            source_length,
            state: PlayState::Idle,
            start_at: 0,
            stop_at: None,
            fade: None,
            pending_fade: None,
            source_pos: 0,
            source_done: false,
            resampler_flushed: false,
            cursor: 0,
            elapsed: 0,
            length: convert_frames(source_length, source_rate, self.sample_rate),
            resampler,
            filter: None,
            scratch: Vec::new(),
            block: Vec::new(),
        };

        let mut st = lock(&self.state);
        let id = st.next_id;
        st.next_id += 1;
        st.sounds.insert(id, sound);
        Some(SoundId(id))
    }

    fn destroy_sound(&self, sound: SoundId) {
        lock(&self.state).sounds.remove(&sound.0);
    }

    fn start_sound_at(&self, sound: SoundId, frame: u64) {
        self.with_sound(sound, |s, _| {
            if s.state == PlayState::Ended && !s.rewind() {
                return;
            }
            s.state = PlayState::Scheduled;
            s.start_at = frame;
        });
    }

    fn stop_sound_at(&self, sound: SoundId, frame: Option<u64>) {
        self.with_sound(sound, |s, _| s.stop_at = frame);
    }

    fn set_fade(&self, sound: SoundId, from: Option<f32>, to: f32, start: u64, length: u64) {
        self.with_sound(sound, |s, clock| {
            let fade = Fade {
                from: from.unwrap_or_else(|| s.envelope_at(start)),
                to,
                start,
                length,
            };
            if start <= clock {
                s.fade = Some(fade);
                s.pending_fade = None;
            } else {
                s.pending_fade = Some(fade);
            }
        });
    }

    fn set_looping(&self, sound: SoundId, looping: bool) {
        self.with_sound(sound, |s, _| s.looping = looping);
    }

    fn attach_filter(&self, sound: SoundId, filter: Box<dyn SoundFilter>) {
        self.with_sound(sound, |s, _| s.filter = Some(filter));
    }

    fn cursor_frames(&self, sound: SoundId) -> u64 {
        self.with_sound(sound, |s, _| s.cursor).unwrap_or(0)
    }

    fn length_frames(&self, sound: SoundId) -> u64 {
        self.with_sound(sound, |s, _| s.length).unwrap_or(0)
    }

    fn is_playing(&self, sound: SoundId) -> bool {
        self.with_sound(sound, |s, _| {
            matches!(s.state, PlayState::Scheduled | PlayState::Playing)
        })
        .unwrap_or(false)
    }

    fn at_end(&self, sound: SoundId) -> bool {
        self.with_sound(sound, |s, _| s.state == PlayState::Ended)
            .unwrap_or(false)
    }
}
