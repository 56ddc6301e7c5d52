//! Shared fixtures for runtime integration tests
//!
//! Banks are built in memory with `BankBuilder`; audio is constant-value
//! 16-bit PCM so rendered output can be checked against simple sums.

#![allow(dead_code)]

use cue_common::bank::{BankBuilder, CodingFormat, FileInfo, FILE_FLAG_STREAM};
use cue_rt::io::MemoryFileSystem;
use cue_rt::jobs::InlineExecutor;
use cue_rt::mix::SoftMixEngine;
use cue_rt::{Context, RuntimeConfig};
use std::sync::Arc;

/// Test output rate; one second is 8000 frames
pub const RATE: u32 = 8000;

/// 16-bit sample written by [`dc_pcm`], as the engine sees it
pub const DC_LEVEL: f32 = 0.25;

/// Mono 16-bit PCM at [`DC_LEVEL`]
pub fn dc_pcm(frames: u32) -> Vec<u8> {
    let sample = (DC_LEVEL * 32_768.0) as i16;
    sample.to_le_bytes().repeat(frames as usize)
}

/// Mono 16-bit PCM ramp: frame `i` holds sample value `i`
pub fn ramp_pcm(frames: u32) -> Vec<u8> {
    (0..frames).flat_map(|i| (i as i16).to_le_bytes()).collect()
}

/// Mono 16-bit PCM file description at the test rate
pub fn pcm_info(frames: u32, data_offset: u32, streamed: bool) -> FileInfo {
    FileInfo {
        coding_format: CodingFormat::PcmS16 as u32,
        sample_rate: RATE,
        channels: 1,
        flags: if streamed { FILE_FLAG_STREAM } else { 0 },
        frame_count: frames,
        loop_start: 0,
        loop_end: 0,
        source_index: 0,
        data_offset,
        data_size: frames * 2,
    }
}

/// Builder with the bus every group plays on
pub fn builder() -> BankBuilder {
    let mut b = BankBuilder::new();
    b.add_bus("main", 1.0);
    b
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig {
        output_sample_rate: RATE,
        random_seed: Some(11),
        ..RuntimeConfig::default()
    }
}

/// Context over an in-memory file system with inline decoding
pub fn context() -> (Context, Arc<SoftMixEngine>, Arc<MemoryFileSystem>) {
    let engine = Arc::new(SoftMixEngine::new(RATE));
    let fs = Arc::new(MemoryFileSystem::new());
    let ctx = Context::new(
        config(),
        Arc::clone(&engine) as _,
        Arc::clone(&fs) as _,
        Arc::new(InlineExecutor),
    )
    .expect("context");
    (ctx, engine, fs)
}

/// Render `frames` frames, ticking the context every `block` frames.
///
/// # Returns
/// Interleaved stereo output
pub fn run(ctx: &mut Context, engine: &SoftMixEngine, frames: usize, block: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames * 2];
    let mut done = 0;
    while done < frames {
        ctx.process_frame();
        let n = block.min(frames - done);
        engine.render(&mut out[done * 2..(done + n) * 2]);
        done += n;
    }
    ctx.process_frame();
    out
}

/// Left-channel sample of stereo frame `frame`
pub fn left(out: &[f32], frame: usize) -> f32 {
    out[frame * 2]
}

pub fn assert_near(actual: f32, expected: f32, tolerance: f32) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {} (+/- {}), got {}",
        expected,
        tolerance,
        actual
    );
}
