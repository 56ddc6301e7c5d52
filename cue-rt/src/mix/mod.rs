//! Mixing-engine collaborator
//!
//! The runtime programs against [`MixEngine`]: groups with volume, sounds
//! created from an [`AudioSource`], start/stop timers and linear fades in
//! output frames, looping, per-sound filters and position queries. All
//! times are output-engine frames on the engine's own clock.
//!
//! [`SoftMixEngine`] is the bundled in-process implementation.

mod fade;
mod soft;

pub use fade::FadeNode;
pub use soft::SoftMixEngine;

use crate::source::AudioSource;

/// Engine sound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoundId(pub u64);

/// Engine mix group (bus or per-instance node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixGroupId(pub u64);

/// Sound creation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundDesc {
    pub volume: f32,
    pub looping: bool,
    /// Loop region in source frames; `loop_end == 0` loops at the end
    pub loop_start: u64,
    pub loop_end: u64,
}

impl Default for SoundDesc {
    fn default() -> Self {
        Self {
            volume: 1.0,
            looping: false,
            loop_start: 0,
            loop_end: 0,
        }
    }
}

/// Where a sound is at the start of a filtered block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayPosition {
    /// Output frames played since the sound first started
    pub elapsed: u64,
    /// Output-frame position inside the file (wraps when looping)
    pub cursor: u64,
    pub looping: bool,
}

/// Per-sound processing stage run on the sound's stereo block before
/// volume and fades
pub trait SoundFilter: Send {
    /// Called only for frames the sound actually plays; a sound that has
    /// not started yet is never filtered. `position` is where the block's
    /// first frame sits.
    fn process(&mut self, block: &mut [f32], channels: usize, position: PlayPosition);
}

/// Programmable surface of a real-time mixing engine
pub trait MixEngine: Send + Sync {
    /// Output sample rate
    fn sample_rate(&self) -> u32;

    /// Output frames rendered so far
    fn time_frames(&self) -> u64;

    /// Create a group, routed into `parent` or straight into the master
    fn create_group(&self, parent: Option<MixGroupId>, volume: f32) -> Option<MixGroupId>;

    fn destroy_group(&self, group: MixGroupId);

    fn set_group_volume(&self, group: MixGroupId, volume: f32);

    fn set_master_volume(&self, volume: f32);

    /// Create a stopped sound playing `source` into `group`
    fn create_sound(
        &self,
        source: Box<dyn AudioSource>,
        group: MixGroupId,
        desc: SoundDesc,
    ) -> Option<SoundId>;

    fn destroy_sound(&self, sound: SoundId);

    /// Start (or resume from the kept cursor) at output frame `frame`
    fn start_sound_at(&self, sound: SoundId, frame: u64);

    /// Stop at output frame `frame`; `None` cancels a pending stop
    fn stop_sound_at(&self, sound: SoundId, frame: Option<u64>);

    /// Linear gain ramp from `from` (`None` = the gain at `start`) to `to`
    /// over `length` frames starting at `start`
    fn set_fade(&self, sound: SoundId, from: Option<f32>, to: f32, start: u64, length: u64);

    fn set_looping(&self, sound: SoundId, looping: bool);

    fn attach_filter(&self, sound: SoundId, filter: Box<dyn SoundFilter>);

    /// Position inside the file in output frames
    fn cursor_frames(&self, sound: SoundId) -> u64;

    /// File length in output frames
    fn length_frames(&self, sound: SoundId) -> u64;

    /// Scheduled or audibly playing
    fn is_playing(&self, sound: SoundId) -> bool;

    /// Played through to its natural end
    fn at_end(&self, sound: SoundId) -> bool;
}
