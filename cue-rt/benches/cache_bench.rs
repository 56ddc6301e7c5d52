//! Hot-path benchmarks
//!
//! Measures the operations that run on every mixer block or control tick:
//! chunk cache hits, node graph advancement, and mixing a full voice set.
//!
//! **Goal:** a 512-frame block of 32 voices mixes far faster than realtime

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cue_common::bank::{Bank, BankBuilder, CodingFormat, FileInfo};
use cue_rt::execution::{advance, ExecutionCursor};
use cue_rt::io::{AsyncFileReader, FileSystem, MemoryFileSystem};
use cue_rt::mix::{MixEngine, SoftMixEngine, SoundDesc};
use cue_rt::source::{AudioSource, ReadResult, ReadStatus};
use cue_rt::streaming::ChunkCache;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;

fn bench_chunk_hits(c: &mut Criterion) {
    let fs = MemoryFileSystem::new();
    fs.insert("s", vec![0u8; 1 << 20]);
    let reader = Arc::new(AsyncFileReader::new(64).unwrap());
    let file = reader.start_async_reading(fs.open(Path::new("s")).unwrap());
    let cache = ChunkCache::new(reader, 64 * 1024, 16);
    let source = cache.register_source(file, 1 << 20);

    // Warm every chunk so the loop measures hits only
    for i in 0..16u64 {
        let chunk = cache.acquire_chunk(source, 0, i * 64 * 1024).unwrap();
        while cache.chunk_data(chunk.index).is_none() {
            std::thread::yield_now();
        }
        cache.release_chunk(chunk.index);
    }

    c.bench_function("chunk_cache/acquire_release_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let chunk = cache
                .acquire_chunk(source, 0, (i % 16) * 64 * 1024)
                .unwrap();
            black_box(chunk.data.as_ref().map(|d| d.len()));
            cache.release_chunk(chunk.index);
            i += 1;
        });
    });
}

fn random_bank(children: usize) -> Bank {
    let mut b = BankBuilder::new();
    b.add_bus("main", 1.0);
    let nodes = (0..children)
        .map(|_| {
            let file = b.add_file(FileInfo {
                coding_format: CodingFormat::PcmS16 as u32,
                sample_rate: 48_000,
                channels: 1,
                flags: 0,
                frame_count: 48_000,
                loop_start: 0,
                loop_end: 0,
                source_index: 0,
                data_offset: 0,
                data_size: 96_000,
            });
            b.file_node(file, false)
        })
        .collect();
    let pick = b.random(nodes);
    let forever = b.repeat(0, pick);
    b.add_group("g", 1.0, 0, 0, Some(forever));
    Bank::from_bytes(b.build()).unwrap()
}

fn bench_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution/advance");
    for children in [2usize, 16, 128] {
        let bank = random_bank(children);
        let first = bank.group(0).unwrap().first_node;
        group.bench_with_input(BenchmarkId::from_parameter(children), &bank, |b, bank| {
            let mut rng = StdRng::seed_from_u64(7);
            let mut cursor = ExecutionCursor::new(first);
            b.iter(|| black_box(advance(bank, &mut cursor, &mut rng)));
        });
    }
    group.finish();
}

/// Endless constant mono source
struct Tone;

impl AudioSource for Tone {
    fn channels(&self) -> usize {
        1
    }

    fn sample_rate(&self) -> u32 {
        48_000
    }

    fn length_frames(&self) -> u64 {
        48_000 * 3600
    }

    fn read(&mut self, out: &mut [f32], frames: usize) -> ReadResult {
        out[..frames].fill(0.1);
        ReadResult {
            frames,
            status: ReadStatus::Ready,
        }
    }

    fn seek(&mut self, _frame: u64) -> bool {
        true
    }
}

fn bench_mix(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix/render_512");
    for voices in [8usize, 32] {
        let engine = SoftMixEngine::new(48_000);
        let bus = engine.create_group(None, 1.0).unwrap();
        for _ in 0..voices {
            let sound = engine
                .create_sound(
                    Box::new(Tone),
                    bus,
                    SoundDesc {
                        volume: 0.5,
                        ..SoundDesc::default()
                    },
                )
                .unwrap();
            engine.start_sound_at(sound, 0);
        }
        let mut out = vec![0.0f32; 512 * 2];
        group.bench_with_input(BenchmarkId::from_parameter(voices), &voices, |b, _| {
            b.iter(|| {
                engine.render(&mut out);
                black_box(out[0]);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chunk_hits, bench_advance, bench_mix);
criterion_main!(benches);
