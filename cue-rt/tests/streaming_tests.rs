//! Streaming path tests: async reader, chunk cache, chunk feed, and
//! streamed playback through the context

mod helpers;

use cue_common::bank::{Action, ActionKind, CodingFormat, FileInfo, FILE_FLAG_STREAM};
use cue_rt::io::{AsyncFileReader, FileSystem, MemoryFileSystem, ReadTarget};
use cue_rt::jobs::{InlineExecutor, Job, JobExecutor};
use cue_rt::mix::SoftMixEngine;
use cue_rt::source::{BlockFeed, ChunkFeed, FeedPoll};
use cue_rt::streaming::{ChunkCache, ChunkStatus, StreamingSourceHandle};
use cue_rt::{Context, RuntimeConfig};
use helpers::*;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

/// 1000-byte source where byte `i` is `i % 251`
fn source_bytes() -> Vec<u8> {
    (0..1000u32).map(|i| (i % 251) as u8).collect()
}

fn cache(chunk_size: usize, chunk_count: usize) -> (Arc<ChunkCache>, StreamingSourceHandle) {
    let fs = MemoryFileSystem::new();
    fs.insert("source.bin", source_bytes());
    let reader = Arc::new(AsyncFileReader::new(16).unwrap());
    let file = reader.start_async_reading(fs.open(Path::new("source.bin")).unwrap());
    let cache = Arc::new(ChunkCache::new(reader, chunk_size, chunk_count));
    let source = cache.register_source(file, 1000);
    (cache, source)
}

fn wait_ready(cache: &ChunkCache, index: u32) -> Arc<[u8]> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(data) = cache.chunk_data(index) {
            return data;
        }
        assert!(Instant::now() < deadline, "chunk {} never became ready", index);
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Async reader
// ============================================================================

#[test]
fn test_reader_tokens_increase_and_complete() {
    let fs = MemoryFileSystem::new();
    fs.insert("f", source_bytes());
    let reader = AsyncFileReader::new(8).unwrap();
    let file = reader.start_async_reading(fs.open(Path::new("f")).unwrap());

    let targets: Vec<Arc<ReadTarget>> = (0..4).map(|_| ReadTarget::new()).collect();
    let tokens: Vec<u32> = targets
        .iter()
        .enumerate()
        .map(|(i, t)| reader.request_read(file, i as u64 * 10, 10, Arc::clone(t)))
        .collect();
    for pair in tokens.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1));
    }

    let close = reader.stop_async_reading(file);
    assert_eq!(close, tokens[3].wrapping_add(1));

    let deadline = Instant::now() + TIMEOUT;
    while reader.check_request_running(close) {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    // Everything published before the close has been served
    for (i, (token, target)) in tokens.iter().zip(&targets).enumerate() {
        assert!(!reader.check_request_running(*token));
        let data = target.data().unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data[0], (i * 10) as u8);
    }
    assert_eq!(reader.pending(), 0);
}

#[test]
fn test_reader_rejects_bad_capacity() {
    assert!(AsyncFileReader::new(0).is_err());
    assert!(AsyncFileReader::new(12).is_err());
    assert_eq!(AsyncFileReader::new(4).unwrap().capacity(), 4);
}

#[test]
fn test_read_past_end_is_short() {
    let fs = MemoryFileSystem::new();
    fs.insert("f", vec![1u8; 30]);
    let reader = AsyncFileReader::new(4).unwrap();
    let file = reader.start_async_reading(fs.open(Path::new("f")).unwrap());
    let target = ReadTarget::new();
    let token = reader.request_read(file, 20, 64, Arc::clone(&target));

    let deadline = Instant::now() + TIMEOUT;
    while reader.check_request_running(token) {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(target.data().unwrap().len(), 10);
}

// ============================================================================
// Chunk cache
// ============================================================================

#[test]
fn test_chunk_hit_shares_data() {
    let (cache, source) = cache(100, 4);
    let first = cache.acquire_chunk(source, 200, 100).unwrap();
    assert_eq!(first.status, ChunkStatus::Reading);
    let data = wait_ready(&cache, first.index);
    assert_eq!(data.len(), 100);
    assert_eq!(data[0], (300 % 251) as u8);

    // Same absolute offset through a different base is the same chunk
    let second = cache.acquire_chunk(source, 0, 300).unwrap();
    assert_eq!(second.index, first.index);
    assert_eq!(second.status, ChunkStatus::Ready);
    assert_eq!(cache.use_count(first.index), 2);

    cache.release_chunk(first.index);
    cache.release_chunk(second.index);
    assert_eq!(cache.use_count(first.index), 0);

    // Idle but still keyed: re-acquiring is a hit
    let again = cache.acquire_chunk(source, 300, 0).unwrap();
    assert_eq!(again.index, first.index);
    assert_eq!(again.status, ChunkStatus::Ready);
}

#[test]
fn test_oldest_released_chunk_recycled_first() {
    let (cache, source) = cache(100, 3);
    let chunks: Vec<u32> = (0..3)
        .map(|i| cache.acquire_chunk(source, 0, i * 100).unwrap().index)
        .collect();
    assert!(cache.acquire_chunk(source, 0, 300).is_none());

    cache.release_chunk(chunks[2]);
    cache.release_chunk(chunks[0]);
    cache.release_chunk(chunks[1]);

    let recycled = cache.acquire_chunk(source, 0, 500).unwrap();
    assert_eq!(recycled.index, chunks[2]);
    assert_eq!(recycled.status, ChunkStatus::Reading);

    // The chunks released later still answer their old keys
    let hit = cache.acquire_chunk(source, 0, 0).unwrap();
    assert_eq!(hit.index, chunks[0]);
    assert_eq!(cache.idle_chunks(), 1);
}

#[test]
fn test_deregister_frees_idle_chunks() {
    let (cache, source) = cache(100, 2);
    let chunk = cache.acquire_chunk(source, 0, 0).unwrap();
    wait_ready(&cache, chunk.index);
    cache.release_chunk(chunk.index);

    assert!(cache.deregister_source(source).is_some());
    assert_eq!(cache.idle_chunks(), 2);
    assert!(cache.chunk_data(chunk.index).is_none());
}

#[test]
fn test_source_slots_reused_with_new_generation() {
    let (cache, source) = cache(100, 2);
    let file = cache.deregister_source(source).unwrap();
    let again = cache.register_source(file, 500);
    assert_ne!(again, source);
    assert_eq!(cache.source_size(again), Some(500));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "stale streaming source handle")]
fn test_stale_source_handle_asserts() {
    let (cache, source) = cache(100, 2);
    cache.deregister_source(source);
    cache.acquire_chunk(source, 0, 0);
}

// ============================================================================
// Chunk feed
// ============================================================================

fn drain_feed(feed: &mut ChunkFeed) -> Vec<(Vec<u8>, bool)> {
    let mut blocks = Vec::new();
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match feed.next_block() {
            FeedPoll::Block(block, last) => blocks.push((block.bytes().to_vec(), last)),
            FeedPoll::Pending => {
                assert!(Instant::now() < deadline, "feed stalled");
                thread::sleep(Duration::from_millis(1));
            }
            FeedPoll::Exhausted => return blocks,
        }
    }
}

#[test]
fn test_feed_cuts_whole_frames() {
    // 100-byte chunks, 6-byte frames: 96-byte blocks
    let (cache, source) = cache(100, 8);
    let mut feed = ChunkFeed::new(Arc::clone(&cache), source, 100, 400, 6);
    let blocks = drain_feed(&mut feed);

    let lens: Vec<usize> = blocks.iter().map(|(b, _)| b.len()).collect();
    assert_eq!(lens, vec![96, 96, 96, 96, 16]);
    assert!(blocks[..4].iter().all(|(_, last)| !last));
    assert!(blocks[4].1);

    let joined: Vec<u8> = blocks.into_iter().flat_map(|(b, _)| b).collect();
    assert_eq!(joined, source_bytes()[100..500].to_vec());
}

#[test]
fn test_feed_holds_chunks_until_released() {
    let (cache, source) = cache(100, 8);
    let mut feed = ChunkFeed::new(Arc::clone(&cache), source, 0, 300, 2);
    let blocks = drain_feed(&mut feed);
    assert_eq!(blocks.len(), 3);
    assert_eq!(feed.held_chunks(), 3);

    feed.release_blocks(2);
    assert_eq!(feed.held_chunks(), 1);
    assert_eq!(cache.idle_chunks(), 7);

    drop(feed);
    assert_eq!(cache.idle_chunks(), 8);
}

#[test]
fn test_feed_restart_aligns_to_block() {
    let (cache, source) = cache(100, 8);
    let mut feed = ChunkFeed::new(Arc::clone(&cache), source, 0, 1000, 4);
    assert_eq!(feed.restart(250), 200);
    let blocks = drain_feed(&mut feed);
    assert_eq!(blocks[0].0[0], 200u8);
    assert_eq!(blocks.len(), 8);
}

// ============================================================================
// Streamed playback
// ============================================================================

#[test]
fn test_streamed_file_plays_in_order() {
    const FRAMES: u32 = 4000;
    let mut b = builder();
    b.add_stream_source("audio/stream.bin");
    let file = b.add_file(pcm_info(FRAMES, 16, true));
    let node = b.file_node(file, false);
    let group = b.add_group("ramp", 1.0, 0, 0, Some(node));
    b.add_event("ramp", vec![Action::new(ActionKind::Play, group, 0)]);

    let fs = Arc::new(MemoryFileSystem::new());
    fs.insert("banks/ramp.bank", b.build());
    let mut stream = vec![0xAAu8; 16];
    stream.extend(ramp_pcm(FRAMES));
    fs.insert("banks/audio/stream.bin", stream);

    // Small chunks so the file spans several reads
    let config = RuntimeConfig {
        chunk_size: 1024,
        chunk_count: 8,
        ..helpers::config()
    };
    let engine = Arc::new(SoftMixEngine::new(RATE));
    let mut ctx = Context::new(
        config,
        Arc::clone(&engine) as _,
        Arc::clone(&fs) as _,
        Arc::new(InlineExecutor),
    )
    .unwrap();

    let bank = ctx.load_bank(Path::new("banks/ramp.bank"), None).unwrap();
    assert!(ctx.fire_event(bank, "ramp", 0));
    assert_eq!(ctx.sounds().streaming_in_use(), 1);

    let mut played = Vec::new();
    let mut block = vec![0.0f32; 200];
    for _ in 0..60 {
        ctx.process_frame();
        engine.render(&mut block);
        played.extend(block.chunks_exact(2).map(|f| f[0]).filter(|s| *s != 0.0));
        let deadline = Instant::now() + TIMEOUT;
        while ctx.cache().reader().pending() > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_micros(200));
        }
    }
    ctx.process_frame();

    // Frame 0 is silent; every later frame arrives once, in order
    let expected: Vec<f32> = (1..FRAMES).map(|i| i as f32 / 32_768.0).collect();
    assert_eq!(played, expected);
    assert!(ctx.active_groups().is_empty());
    assert_eq!(ctx.sounds().streaming_in_use(), 0);

    assert!(ctx.unload_bank(bank));
    let deadline = Instant::now() + TIMEOUT;
    while ctx.pending_unloads() > 0 {
        assert!(Instant::now() < deadline);
        ctx.process_frame();
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Deferred release
// ============================================================================

/// Executor that holds every job until told to run them
#[derive(Default)]
struct HeldJobs {
    jobs: Mutex<Vec<Job>>,
}

impl HeldJobs {
    fn held(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn run_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
        for job in jobs {
            job();
        }
    }
}

impl JobExecutor for HeldJobs {
    fn launch(&self, job: Job) -> bool {
        self.jobs.lock().unwrap().push(job);
        true
    }
}

#[test]
fn test_release_waits_for_decode_job() {
    const MP3_FRAMES: usize = 10;
    let mut frame = vec![0u8; 417];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
    let mp3 = frame.repeat(MP3_FRAMES);

    let mut b = builder();
    b.add_stream_source("audio/music.mp3");
    let file = b.add_file(FileInfo {
        coding_format: CodingFormat::Mp3 as u32,
        sample_rate: 44_100,
        channels: 2,
        flags: FILE_FLAG_STREAM,
        frame_count: (MP3_FRAMES * 1152) as u32,
        loop_start: 0,
        loop_end: 0,
        source_index: 0,
        data_offset: 0,
        data_size: mp3.len() as u32,
    });
    let node = b.file_node(file, false);
    let group = b.add_group("music", 1.0, 0, 0, Some(node));
    b.add_event("music", vec![Action::new(ActionKind::Play, group, 0)]);

    let fs = Arc::new(MemoryFileSystem::new());
    fs.insert("banks/music.bank", b.build());
    fs.insert("banks/audio/music.mp3", mp3);

    let jobs = Arc::new(HeldJobs::default());
    let engine = Arc::new(SoftMixEngine::new(RATE));
    let mut ctx = Context::new(
        helpers::config(),
        Arc::clone(&engine) as _,
        Arc::clone(&fs) as _,
        Arc::clone(&jobs) as _,
    )
    .unwrap();
    let bank = ctx.load_bank(Path::new("banks/music.bank"), None).unwrap();
    assert!(ctx.fire_event(bank, "music", 0));

    // Pull until the first chunk arrives and the decoder launches its job
    let mut block = vec![0.0f32; 256];
    let deadline = Instant::now() + TIMEOUT;
    while jobs.held() == 0 {
        assert!(Instant::now() < deadline, "decode job never launched");
        ctx.process_frame();
        engine.render(&mut block);
        thread::sleep(Duration::from_millis(1));
    }

    // The job still owns the decoder, so the source and its registration stay
    assert!(ctx.unload_bank(bank));
    assert_eq!(ctx.sounds().sound_count(), 0);
    assert_eq!(ctx.sounds().deferred_count(), 1);
    assert_eq!(ctx.sounds().streaming_in_use(), 1);
    assert_eq!(ctx.pending_unloads(), 1);

    ctx.process_frame();
    assert_eq!(ctx.sounds().deferred_count(), 1);
    assert_eq!(ctx.pending_unloads(), 1);

    jobs.run_all();
    ctx.process_frame();
    assert_eq!(ctx.sounds().deferred_count(), 0);
    assert_eq!(ctx.sounds().streaming_in_use(), 0);

    let deadline = Instant::now() + TIMEOUT;
    while ctx.pending_unloads() > 0 {
        assert!(Instant::now() < deadline, "registration never closed");
        ctx.process_frame();
        thread::sleep(Duration::from_millis(1));
    }
}
