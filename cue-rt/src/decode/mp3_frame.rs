//! MPEG audio frame header scanning
//!
//! Just enough of the header to split a byte stream into whole frames: sync
//! word, version, layer, bitrate, sample rate and padding. ID3v2 tags at the
//! head of a stream are measured so they can be skipped.

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sample_rate: u32,
    pub channels: u32,
    /// Total frame length in bytes, header included
    pub frame_len: usize,
    /// PCM frames this MPEG frame decodes to
    pub samples_per_frame: usize,
}

/// Outcome of scanning at a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// A valid header starts here
    Frame(FrameHeader),
    /// Fewer than four bytes left
    NeedMore,
    /// No frame sync at this position
    NoSync,
}

// kbit/s, index 1..=14; [version class][layer]
const BITRATES_V1: [[u32; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];
const BITRATES_V2: [[u32; 15]; 3] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];
const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];

/// Parse the header at the start of `bytes`
pub fn scan_header(bytes: &[u8]) -> Scan {
    if bytes.len() < 4 {
        return Scan::NeedMore;
    }
    let h = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if h & 0xFFE0_0000 != 0xFFE0_0000 {
        return Scan::NoSync;
    }

    // 0 = 2.5, 2 = MPEG-2, 3 = MPEG-1
    let version = (h >> 19) & 0x3;
    // 1 = III, 2 = II, 3 = I
    let layer = (h >> 17) & 0x3;
    let bitrate_index = ((h >> 12) & 0xF) as usize;
    let rate_index = ((h >> 10) & 0x3) as usize;
    let padding = (h >> 9) & 0x1;
    let mode = (h >> 6) & 0x3;

    if version == 1 || layer == 0 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return Scan::NoSync;
    }

    let layer_row = (3 - layer) as usize;
    let bitrate = if version == 3 {
        BITRATES_V1[layer_row][bitrate_index]
    } else {
        BITRATES_V2[layer_row][bitrate_index]
    } * 1000;
    let sample_rate = match version {
        3 => SAMPLE_RATES_V1[rate_index],
        2 => SAMPLE_RATES_V1[rate_index] / 2,
        _ => SAMPLE_RATES_V1[rate_index] / 4,
    };

    let (frame_len, samples_per_frame) = match layer {
        3 => (((12 * bitrate / sample_rate) + padding) * 4, 384),
        2 => ((144 * bitrate / sample_rate) + padding, 1152),
        _ if version == 3 => ((144 * bitrate / sample_rate) + padding, 1152),
        _ => ((72 * bitrate / sample_rate) + padding, 576),
    };

    Scan::Frame(FrameHeader {
        sample_rate,
        channels: if mode == 3 { 1 } else { 2 },
        frame_len: frame_len as usize,
        samples_per_frame,
    })
}

/// Total size of an ID3v2 tag at the start of `bytes`.
///
/// `None` when there is no tag or the ten-byte tag header is incomplete.
pub fn id3v2_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 10 || &bytes[..3] != b"ID3" {
        return None;
    }
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | (*b as usize & 0x7F));
    let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
    Some(10 + size + footer)
}
