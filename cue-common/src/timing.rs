//! Tick-based timing for sample-accurate scheduling
//!
//! All authored times in a bank are integer milliseconds, files carry their
//! own sample rate, and the mixing engine runs on its own output clock. To
//! keep scheduling arithmetic in a single clock domain, every conversion goes
//! through a tick rate of 28,224,000 Hz, which divides evenly into all common
//! audio sample rates (8kHz to 192kHz).
//!
//! # Conversion Flow
//!
//! ```text
//! Bank (ms)          File (source frames @ file rate)
//!     ↓                     ↓
//! ms_to_ticks()      frames_to_ticks()
//!     ↓                     ↓
//!        ticks (28,224,000 Hz)
//!                ↓
//!        ticks_to_frames()  → output frames @ engine rate
//! ```
//!
//! | Rate (Hz) | Ticks/Frame |
//! |-----------|-------------|
//! | 8,000     | 3,528       |
//! | 22,050    | 1,280       |
//! | 44,100    | 640         |
//! | 48,000    | 588         |
//! | 96,000    | 294         |
//!
//! Conversions use 128-bit intermediates, so rates that do not divide the
//! tick rate still convert without overflow (truncating toward zero).
//!
//! # Examples
//!
//! ```rust
//! use cue_common::timing::*;
//!
//! assert_eq!(ms_to_ticks(5000), 141_120_000);
//! assert_eq!(ms_to_frames(100, 48_000), 4_800);
//! assert_eq!(convert_frames(44_100, 44_100, 48_000), 48_000);
//! ```

/// Tick rate: 28,224,000 Hz
pub const TICK_RATE: u64 = 28_224_000;

/// Ticks per millisecond: 28,224
pub const TICKS_PER_MS: u64 = 28_224;

/// Convert milliseconds to ticks (lossless)
pub fn ms_to_ticks(milliseconds: u64) -> u64 {
    milliseconds * TICKS_PER_MS
}

/// Convert ticks to milliseconds using truncating division
///
/// ```rust
/// use cue_common::timing::ticks_to_ms;
///
/// assert_eq!(ticks_to_ms(28_224), 1);
/// assert_eq!(ticks_to_ms(28_223), 0);
/// ```
pub fn ticks_to_ms(ticks: u64) -> u64 {
    ticks / TICKS_PER_MS
}

/// Convert ticks to frames at a given sample rate
///
/// Exact for every rate that divides the tick rate.
///
/// # Panics
///
/// Panics if `sample_rate` is 0
pub fn ticks_to_frames(ticks: u64, sample_rate: u32) -> u64 {
    assert!(sample_rate > 0, "sample_rate must be > 0");
    ((ticks as u128 * sample_rate as u128) / TICK_RATE as u128) as u64
}

/// Convert frames at a given sample rate to ticks
///
/// # Panics
///
/// Panics if `sample_rate` is 0
pub fn frames_to_ticks(frames: u64, sample_rate: u32) -> u64 {
    assert!(sample_rate > 0, "sample_rate must be > 0");
    ((frames as u128 * TICK_RATE as u128) / sample_rate as u128) as u64
}

/// Convert authored milliseconds directly to frames at `sample_rate`
pub fn ms_to_frames(milliseconds: u64, sample_rate: u32) -> u64 {
    ticks_to_frames(ms_to_ticks(milliseconds), sample_rate)
}

/// Convert frames to milliseconds (truncating), mostly for log output
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    ticks_to_ms(frames_to_ticks(frames, sample_rate))
}

/// Re-express a frame count from one sample rate in another
///
/// Used to map a file's length and cursor (source rate) onto the output
/// clock (engine rate).
pub fn convert_frames(frames: u64, from_rate: u32, to_rate: u32) -> u64 {
    if from_rate == to_rate {
        return frames;
    }
    ticks_to_frames(frames_to_ticks(frames, from_rate), to_rate)
}

/// Ticks per frame at a given sample rate (truncated for non-divisor rates)
pub fn ticks_per_frame(sample_rate: u32) -> u64 {
    assert!(sample_rate > 0, "sample_rate must be > 0");
    TICK_RATE / sample_rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATES: [u32; 11] = [
        8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
    ];

    #[test]
    fn test_tick_rate_divides_common_rates() {
        for rate in RATES {
            assert_eq!(TICK_RATE % rate as u64, 0, "rate {} must divide tick rate", rate);
        }
    }

    #[test]
    fn test_ms_tick_roundtrip() {
        for ms in [0, 1, 17, 1000, 86_400_000] {
            assert_eq!(ticks_to_ms(ms_to_ticks(ms)), ms);
        }
    }

    #[test]
    fn test_frames_roundtrip_exact_for_common_rates() {
        for rate in RATES {
            let frames = rate as u64 * 3 + 17;
            assert_eq!(ticks_to_frames(frames_to_ticks(frames, rate), rate), frames);
        }
    }

    #[test]
    fn test_ms_to_frames() {
        assert_eq!(ms_to_frames(1000, 44100), 44_100);
        assert_eq!(ms_to_frames(100, 8000), 800);
        assert_eq!(ms_to_frames(3000, 48000), 144_000);
    }

    #[test]
    fn test_convert_frames_between_rates() {
        assert_eq!(convert_frames(22_050, 22_050, 44_100), 44_100);
        assert_eq!(convert_frames(48_000, 48_000, 8_000), 8_000);
        assert_eq!(convert_frames(12_345, 44_100, 44_100), 12_345);
    }

    #[test]
    fn test_non_divisor_rate_truncates() {
        // 12345 Hz does not divide the tick rate; conversion must still be sane
        let ticks = frames_to_ticks(12_345, 12_345);
        assert!(ticks <= TICK_RATE);
        assert!(TICK_RATE - ticks < ticks_per_frame(12_345) * 2);
    }

    #[test]
    #[should_panic(expected = "sample_rate must be > 0")]
    fn test_zero_rate_panics() {
        ticks_to_frames(1, 0);
    }
}
