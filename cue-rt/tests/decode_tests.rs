//! Decoding sources over resident data
//!
//! MP3 streams are synthesized from silent MPEG-1 Layer III frames
//! (128 kbit/s, 44.1 kHz, stereo, 417 bytes each) so frame boundaries and
//! block boundaries can be placed deliberately.

use cue_rt::decode::{Decoder, Mp3Decoder, PcmDecoder, PcmFormat};
use cue_rt::jobs::InlineExecutor;
use cue_rt::source::{AudioSource, BufferSource, ReadStatus, ResidentFeed};
use std::sync::Arc;

const MP3_FRAME_LEN: usize = 417;
const MP3_FRAME_SAMPLES: u64 = 1152;

fn silent_mp3(frames: usize) -> Vec<u8> {
    let mut frame = vec![0u8; MP3_FRAME_LEN];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
    frame.repeat(frames)
}

fn mp3_source(data: Vec<u8>, frames: u64, block_size: usize) -> BufferSource {
    let data: Arc<[u8]> = Arc::from(data);
    let end = data.len();
    let decoder = Mp3Decoder::new(44_100, 2, Arc::new(InlineExecutor), 4, 1).unwrap();
    BufferSource::new(
        ResidentFeed::new(data, 0, end, block_size, 1),
        Decoder::Mp3(decoder),
        2,
        44_100,
        frames,
        None,
    )
}

/// Read until the source ends.
///
/// # Returns
/// Every delivered sample
fn read_to_end<S: AudioSource>(source: &mut S, block: usize) -> Vec<f32> {
    let channels = source.channels();
    let mut buf = vec![0.0f32; block * channels];
    let mut all = Vec::new();
    for _ in 0..10_000 {
        let result = source.read(&mut buf, block);
        all.extend_from_slice(&buf[..result.frames * channels]);
        if result.status == ReadStatus::End {
            return all;
        }
    }
    panic!("source never ended");
}

#[test]
fn test_mp3_frames_straddling_blocks() {
    // 300-byte blocks split almost every frame across two blocks
    let mut source = mp3_source(silent_mp3(5), 5 * MP3_FRAME_SAMPLES, 300);
    let samples = read_to_end(&mut source, 256);
    assert_eq!(samples.len() as u64, 5 * MP3_FRAME_SAMPLES * 2);
    assert!(samples.iter().all(|s| *s == 0.0));
    assert_eq!(source.position(), 5 * MP3_FRAME_SAMPLES);
}

#[test]
fn test_mp3_leading_id3_tag_is_skipped() {
    // 20-byte tag cut by the first 16-byte block
    let mut data = b"ID3\x04\x00\x00\x00\x00\x00\x0a".to_vec();
    data.extend_from_slice(&[0u8; 10]);
    data.extend(silent_mp3(2));
    let mut source = mp3_source(data, 2 * MP3_FRAME_SAMPLES, 16);
    let samples = read_to_end(&mut source, 512);
    assert_eq!(samples.len() as u64, 2 * MP3_FRAME_SAMPLES * 2);
}

#[test]
fn test_mp3_seek_decodes_and_skips() {
    let mut source = mp3_source(silent_mp3(4), 4 * MP3_FRAME_SAMPLES, 1024);
    let mut buf = vec![0.0f32; 200 * 2];
    source.read(&mut buf, 200);

    assert!(source.seek(2000));
    assert_eq!(source.position(), 2000);
    let samples = read_to_end(&mut source, 300);
    assert_eq!(samples.len() as u64, (4 * MP3_FRAME_SAMPLES - 2000) * 2);
    assert!(!source.seek(4 * MP3_FRAME_SAMPLES));
}

#[test]
fn test_mp3_short_stream_ends_early() {
    // Header promises more frames than the data holds
    let mut source = mp3_source(silent_mp3(2), 10 * MP3_FRAME_SAMPLES, 4096);
    let samples = read_to_end(&mut source, 1000);
    assert_eq!(samples.len() as u64, 2 * MP3_FRAME_SAMPLES * 2);
}

fn pcm_source(frames: u32, block_size: usize) -> BufferSource {
    let bytes: Vec<u8> = (0..frames)
        .flat_map(|i| {
            let left = (i as i16).to_le_bytes();
            let right = (-(i as i16)).to_le_bytes();
            [left[0], left[1], right[0], right[1]]
        })
        .collect();
    let data: Arc<[u8]> = Arc::from(bytes);
    let end = data.len();
    BufferSource::new(
        ResidentFeed::new(data, 0, end, block_size, 4),
        Decoder::Pcm(PcmDecoder::new(PcmFormat::S16)),
        2,
        8000,
        u64::from(frames),
        Some(4),
    )
}

#[test]
fn test_pcm_reads_across_blocks() {
    // 64-byte blocks hold 16 frames; reads of 10 cross them
    let mut source = pcm_source(100, 64);
    let samples = read_to_end(&mut source, 10);
    assert_eq!(samples.len(), 200);
    for (i, frame) in samples.chunks_exact(2).enumerate() {
        assert_eq!(frame[0], i as f32 / 32_768.0);
        assert_eq!(frame[1], -(i as f32) / 32_768.0);
    }
}

#[test]
fn test_pcm_seek_by_byte_offset() {
    let mut source = pcm_source(100, 64);
    assert!(source.seek(37));
    let mut buf = [0.0f32; 2];
    let result = source.read(&mut buf, 1);
    assert_eq!(result.frames, 1);
    assert_eq!(buf[0], 37.0 / 32_768.0);
}
