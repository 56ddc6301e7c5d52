//! Active groups
//!
//! An [`ActiveGroup`] is one playing instance of an authored group for one
//! caller object. It holds at most a current sound and a pre-rolled next
//! sound. The next sound is started early enough that it crossfades into the
//! current one over the group's cross-fade time:
//!
//! ```text
//! end   = max(now, current.start) + (length - cursor)
//! start = end - cross_fade + delay         (remaining > cross_fade)
//! start = max(now, current.start) + delay  (otherwise, fading over what remains)
//! ```
//!
//! A looping current sound has no next sound until its loop is broken.
//! Stop and pause fade out and put stop timers on both sounds; release
//! waits until the engine reports them silent.

use crate::execution::{advance, ExecutionCursor, ProducedSound};
use crate::mix::{MixEngine, MixGroupId, SoundId};
use crate::pool::Handle;
use crate::sound::{FileData, SoundManager, SoundRequest};
use cue_common::bank::Bank;
use cue_common::timing::ms_to_frames;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Produced files tried per realization before giving up
const MAX_REALIZE_ATTEMPTS: usize = 16;
/// Promotions handled per process call
const MAX_PROMOTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledSound {
    handle: Handle,
    sound: SoundId,
    /// Output frame the sound starts at
    start: u64,
    looping: bool,
    length: u64,
    /// Delay from the graph, in output frames
    delay: u64,
}

/// Borrowed collaborators for one group operation
pub struct GroupEnv<'a> {
    pub bank: &'a Bank,
    pub files: &'a [FileData],
    pub sounds: &'a mut SoundManager,
    pub engine: &'a dyn MixEngine,
    pub rng: &'a mut StdRng,
}

pub struct ActiveGroup {
    bank: Handle,
    group_index: u32,
    object_id: u64,
    bus_index: u32,
    state: GroupState,
    cursor: ExecutionCursor,
    current: Option<ScheduledSound>,
    next: Option<ScheduledSound>,
    mix_group: MixGroupId,
    /// Cross-fade time in output frames
    cross_fade: u64,
    exhausted: bool,
}

impl ActiveGroup {
    /// Start an instance of group `group_index` routed into `bus`.
    ///
    /// # Arguments
    /// - `fade_ms`: fade-in of the first sound
    ///
    /// # Returns
    /// `None` when the group is unknown, no mix node is available or the
    /// graph produces no playable sound
    pub fn start(
        env: &mut GroupEnv<'_>,
        bank: Handle,
        group_index: u32,
        object_id: u64,
        bus: MixGroupId,
        fade_ms: u32,
    ) -> Option<Self> {
        let group = env.bank.group(group_index)?;
        let mix_group = env.engine.create_group(Some(bus), group.volume)?;
        let rate = env.engine.sample_rate();

        let mut active = Self {
            bank,
            group_index,
            object_id,
            bus_index: group.bus_index,
            state: GroupState::Playing,
            cursor: ExecutionCursor::new(group.first_node),
            current: None,
            next: None,
            mix_group,
            cross_fade: ms_to_frames(u64::from(group.cross_fade_ms), rate),
            exhausted: false,
        };

        let Some(first) = active.realize(env) else {
            debug!("Group {} produced no sound", group_index);
            env.engine.destroy_group(mix_group);
            return None;
        };
        active.start_current(env.engine, first, ms_to_frames(u64::from(fade_ms), rate));
        active.schedule_next(env);

        debug!(
            "Group {} started for object {} (cross-fade {} frames)",
            group_index, object_id, active.cross_fade
        );
        Some(active)
    }

    pub fn bank(&self) -> Handle {
        self.bank
    }

    pub fn group_index(&self) -> u32 {
        self.group_index
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn bus_index(&self) -> u32 {
        self.bus_index
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == GroupState::Paused
    }

    pub fn matches(&self, bank: Handle, group_index: u32, object_id: u64) -> bool {
        self.bank == bank && self.group_index == group_index && self.object_id == object_id
    }

    pub fn current_sound(&self) -> Option<Handle> {
        self.current.map(|s| s.handle)
    }

    pub fn next_sound(&self) -> Option<Handle> {
        self.next.map(|s| s.handle)
    }

    /// Scheduled start of the pre-rolled sound
    pub fn next_start(&self) -> Option<u64> {
        self.next.map(|s| s.start)
    }

    /// Create the next playable sound from the graph
    fn realize(&mut self, env: &mut GroupEnv<'_>) -> Option<ScheduledSound> {
        for _ in 0..MAX_REALIZE_ATTEMPTS {
            let Some(produced) = advance(env.bank, &mut self.cursor, &mut *env.rng) else {
                self.exhausted = true;
                return None;
            };
            if let Some(sound) = self.create(env, produced) {
                return Some(sound);
            }
        }
        warn!(
            "Group {}: no playable file after {} attempts",
            self.group_index, MAX_REALIZE_ATTEMPTS
        );
        None
    }

    fn create(&self, env: &mut GroupEnv<'_>, produced: ProducedSound) -> Option<ScheduledSound> {
        let file_index = produced.file.file_index;
        let info = env.bank.file(file_index)?;
        let data = env.files.get(file_index as usize)?;
        let filter = match produced.file.filter_offset {
            0 => None,
            offset => env.bank.fade_filter(offset),
        };
        let looping = produced.file.is_looping();
        let handle = env.sounds.create_sound(
            env.engine,
            SoundRequest {
                file_index,
                info,
                data,
                looping,
                filter,
                group: self.mix_group,
            },
        )?;
        let sound = env.sounds.sound_id(handle)?;
        Some(ScheduledSound {
            handle,
            sound,
            start: 0,
            looping,
            length: env.engine.length_frames(sound),
            delay: ms_to_frames(produced.delay_ms, env.engine.sample_rate()),
        })
    }

    fn start_current(&mut self, engine: &dyn MixEngine, mut sound: ScheduledSound, fade: u64) {
        sound.start = engine.time_frames() + sound.delay;
        engine.start_sound_at(sound.sound, sound.start);
        if fade > 0 {
            engine.set_fade(sound.sound, Some(0.0), 1.0, sound.start, fade);
        }
        self.current = Some(sound);
    }

    /// Pre-roll the next sound unless the current one loops
    fn schedule_next(&mut self, env: &mut GroupEnv<'_>) {
        if self.next.is_some() || self.exhausted {
            return;
        }
        match self.current {
            Some(current) if !current.looping => {}
            _ => return,
        }
        if let Some(next) = self.realize(env) {
            self.next = Some(next);
            self.arm_next(env.engine);
        }
    }

    /// Time the next sound against what remains of the current one
    fn arm_next(&mut self, engine: &dyn MixEngine) {
        let (Some(current), Some(next)) = (self.current, self.next.as_mut()) else {
            return;
        };
        let now = engine.time_frames();
        let base = now.max(current.start);
        let remaining = current.length.saturating_sub(engine.cursor_frames(current.sound));
        let end = base + remaining;
        let fade = self.cross_fade;

        engine.stop_sound_at(next.sound, None);
        if fade == 0 {
            next.start = end + next.delay;
            engine.start_sound_at(next.sound, next.start);
        } else if remaining > fade {
            let fade_at = end - fade;
            next.start = fade_at + next.delay;
            engine.start_sound_at(next.sound, next.start);
            engine.set_fade(next.sound, Some(0.0), 1.0, next.start, fade);
            engine.set_fade(current.sound, None, 0.0, fade_at, fade);
        } else {
            next.start = base + next.delay;
            engine.start_sound_at(next.sound, next.start);
            engine.set_fade(next.sound, Some(0.0), 1.0, next.start, remaining);
            engine.set_fade(current.sound, None, 0.0, base, remaining);
        }
        trace!(
            "Group {}: next sound at {} (current ends {})",
            self.group_index,
            next.start,
            end
        );
    }

    /// Advance one control tick.
    ///
    /// # Returns
    /// `false` once the instance has nothing left and can be dropped
    pub fn process(&mut self, env: &mut GroupEnv<'_>) -> bool {
        match self.state {
            GroupState::Paused => true,
            GroupState::Stopped => {
                for slot in [&mut self.current, &mut self.next] {
                    if let Some(s) = *slot {
                        if !env.engine.is_playing(s.sound) {
                            env.sounds.release_sound(env.engine, s.handle);
                            *slot = None;
                        }
                    }
                }
                self.current.is_some() || self.next.is_some()
            }
            GroupState::Playing => {
                for _ in 0..MAX_PROMOTIONS {
                    let finished = match self.current {
                        Some(current) => {
                            env.engine.at_end(current.sound) || !env.engine.is_playing(current.sound)
                        }
                        None => true,
                    };
                    if !finished {
                        break;
                    }
                    if let Some(current) = self.current.take() {
                        env.sounds.release_sound(env.engine, current.handle);
                    }
                    self.current = self.next.take();
                    if self.current.is_none() && !self.exhausted {
                        // Pre-roll failed earlier; start the following sound now
                        if let Some(sound) = self.realize(env) {
                            self.start_current(env.engine, sound, 0);
                        }
                    }
                    if self.current.is_none() {
                        debug!("Group {} finished for object {}", self.group_index, self.object_id);
                        return false;
                    }
                    self.schedule_next(env);
                }
                true
            }
        }
    }

    /// Fade both sounds out over `fade_ms` and stop them
    pub fn stop(&mut self, engine: &dyn MixEngine, fade_ms: u32) {
        if self.state == GroupState::Stopped {
            return;
        }
        self.state = GroupState::Stopped;
        self.fade_out(engine, fade_ms);
        debug!("Group {} stopping over {}ms", self.group_index, fade_ms);
    }

    /// Fade out and hold both sounds, keeping their resources
    pub fn pause(&mut self, engine: &dyn MixEngine, fade_ms: u32) {
        if self.state != GroupState::Playing {
            return;
        }
        self.state = GroupState::Paused;
        self.fade_out(engine, fade_ms);
        debug!("Group {} paused", self.group_index);
    }

    fn fade_out(&mut self, engine: &dyn MixEngine, fade_ms: u32) {
        let now = engine.time_frames();
        let fade = ms_to_frames(u64::from(fade_ms), engine.sample_rate());
        for s in [self.current, self.next].into_iter().flatten() {
            if s.start > now {
                // Not audible yet
                engine.stop_sound_at(s.sound, Some(now));
            } else {
                engine.set_fade(s.sound, None, 0.0, now, fade);
                engine.stop_sound_at(s.sound, Some(now + fade));
            }
        }
    }

    /// Cancel the pause stop timers and fade back in over `fade_ms`
    pub fn resume(&mut self, env: &mut GroupEnv<'_>, fade_ms: u32) {
        if self.state != GroupState::Paused {
            return;
        }
        self.state = GroupState::Playing;
        let engine = env.engine;
        let now = engine.time_frames();
        let fade = ms_to_frames(u64::from(fade_ms), engine.sample_rate());

        if let Some(current) = self.current.as_mut() {
            engine.stop_sound_at(current.sound, None);
            if !engine.is_playing(current.sound) && !engine.at_end(current.sound) {
                current.start = now;
                engine.start_sound_at(current.sound, now);
            }
            engine.set_fade(current.sound, None, 1.0, now, fade);
        }
        if self.next.is_some() {
            self.arm_next(engine);
        } else {
            self.schedule_next(env);
        }
        debug!("Group {} resumed", self.group_index);
    }

    /// Let a looping current sound run out and crossfade into the next
    pub fn break_loop(&mut self, env: &mut GroupEnv<'_>) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if !current.looping {
            return;
        }
        current.looping = false;
        env.engine.set_looping(current.sound, false);
        debug!("Group {} loop broken", self.group_index);
        if self.state == GroupState::Playing {
            self.schedule_next(env);
        }
    }

    /// Destroy both sounds and the mix node at once
    pub fn release(mut self, sounds: &mut SoundManager, engine: &dyn MixEngine) {
        for s in [self.current.take(), self.next.take()].into_iter().flatten() {
            sounds.release_sound(engine, s.handle);
        }
        engine.destroy_group(self.mix_group);
    }

    /// Destroy the mix node of an instance whose sounds are already gone
    pub fn finish(self, engine: &dyn MixEngine) {
        engine.destroy_group(self.mix_group);
    }
}
