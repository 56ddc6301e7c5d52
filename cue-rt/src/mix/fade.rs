//! Fade graph node
//!
//! Linear fade-in over the first `fade_in` frames a sound plays, and a
//! linear fade-out over the last `fade_out` frames of the file. The
//! fade-out is skipped while the sound loops.

use super::{PlayPosition, SoundFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeNode {
    fade_in: u64,
    fade_out: u64,
    length: u64,
}

impl FadeNode {
    /// All arguments in output frames
    pub fn new(fade_in: u64, fade_out: u64, length: u64) -> Self {
        Self {
            fade_in,
            fade_out: fade_out.min(length),
            length,
        }
    }

    /// Gain at `elapsed` frames played and `cursor` frames into the file
    pub fn gain_at(&self, elapsed: u64, cursor: u64, looping: bool) -> f32 {
        let mut gain = 1.0;
        if self.fade_in > 0 && elapsed < self.fade_in {
            gain *= elapsed as f32 / self.fade_in as f32;
        }
        if !looping && self.fade_out > 0 {
            let fade_start = self.length - self.fade_out;
            if cursor >= fade_start {
                let left = self.length.saturating_sub(cursor);
                gain *= left as f32 / self.fade_out as f32;
            }
        }
        gain
    }
}

impl SoundFilter for FadeNode {
    fn process(&mut self, block: &mut [f32], channels: usize, position: PlayPosition) {
        for (i, frame) in block.chunks_mut(channels.max(1)).enumerate() {
            let gain = self.gain_at(
                position.elapsed + i as u64,
                position.cursor + i as u64,
                position.looping,
            );
            if gain != 1.0 {
                frame.iter_mut().for_each(|s| *s *= gain);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramps() {
        let node = FadeNode::new(100, 50, 1000);
        assert_eq!(node.gain_at(0, 0, false), 0.0);
        assert_eq!(node.gain_at(50, 50, false), 0.5);
        assert_eq!(node.gain_at(500, 500, false), 1.0);
        assert_eq!(node.gain_at(975, 975, false), 0.5);
        assert_eq!(node.gain_at(1000, 1000, false), 0.0);
    }

    #[test]
    fn test_no_fade_out_while_looping() {
        let node = FadeNode::new(0, 50, 1000);
        assert_eq!(node.gain_at(2975, 975, true), 1.0);
        assert_eq!(node.gain_at(2975, 975, false), 0.5);
    }

    #[test]
    fn test_block_ramps_from_first_played_frame() {
        let mut node = FadeNode::new(4, 0, 100);
        let mut block = [1.0f32; 12];
        node.process(
            &mut block,
            2,
            PlayPosition {
                elapsed: 0,
                cursor: 0,
                looping: false,
            },
        );
        assert_eq!(block, [0.0, 0.0, 0.25, 0.25, 0.5, 0.5, 0.75, 0.75, 1.0, 1.0, 1.0, 1.0]);
    }
}
