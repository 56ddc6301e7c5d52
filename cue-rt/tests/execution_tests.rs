//! Node graph execution against built banks

mod helpers;

use cue_common::bank::{Bank, NodeRef};
use cue_rt::execution::{advance, ExecutionCursor};
use helpers::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Bank whose group 0 starts at the node returned by `build`, with `files`
/// one-second files
fn bank_with<F>(files: u32, build: F) -> Bank
where
    F: FnOnce(&mut cue_common::BankBuilder, &[u32]) -> NodeRef,
{
    let mut b = builder();
    let indices: Vec<u32> = (0..files).map(|_| b.add_file(pcm_info(RATE, 0, false))).collect();
    let first = build(&mut b, &indices);
    b.add_group("g", 1.0, 0, 0, Some(first));
    Bank::from_bytes(b.build()).unwrap()
}

fn cursor(bank: &Bank) -> ExecutionCursor {
    ExecutionCursor::new(bank.group(0).unwrap().first_node)
}

/// File indices produced until exhaustion, capped at `limit`
fn produce(bank: &Bank, rng: &mut StdRng, limit: usize) -> Vec<u32> {
    let mut cursor = cursor(bank);
    let mut files = Vec::new();
    while files.len() < limit {
        match advance(bank, &mut cursor, rng) {
            Some(produced) => files.push(produced.file.file_index),
            None => break,
        }
    }
    files
}

#[test]
fn test_sequence_plays_children_in_order() {
    let bank = bank_with(3, |b, f| {
        let children = f.iter().map(|&i| b.file_node(i, false)).collect();
        b.sequence(children)
    });
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(produce(&bank, &mut rng, 10), vec![0, 1, 2]);
}

#[test]
fn test_repeat_runs_child_count_times() {
    let bank = bank_with(2, |b, f| {
        let children = vec![b.file_node(f[0], false), b.file_node(f[1], false)];
        let seq = b.sequence(children);
        b.repeat(3, seq)
    });
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(produce(&bank, &mut rng, 100), vec![0, 1, 0, 1, 0, 1]);
}

#[test]
fn test_repeat_zero_never_ends() {
    let bank = bank_with(1, |b, f| {
        let node = b.file_node(f[0], false);
        b.repeat(0, node)
    });
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(produce(&bank, &mut rng, 500).len(), 500);
}

#[test]
fn test_nested_repeats_multiply() {
    let bank = bank_with(1, |b, f| {
        let node = b.file_node(f[0], false);
        let inner = b.repeat(2, node);
        b.repeat(3, inner)
    });
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(produce(&bank, &mut rng, 100).len(), 6);
}

#[test]
fn test_seeded_random_is_reproducible() {
    let bank = bank_with(4, |b, f| {
        let children = f.iter().map(|&i| b.file_node(i, false)).collect();
        let pick = b.random(children);
        b.repeat(64, pick)
    });

    let first = produce(&bank, &mut StdRng::seed_from_u64(42), 100);
    let second = produce(&bank, &mut StdRng::seed_from_u64(42), 100);
    assert_eq!(first.len(), 64);
    assert_eq!(first, second);
    // 64 draws over four children reach all of them
    for file in 0..4 {
        assert!(first.contains(&file), "file {} never picked", file);
    }
}

#[test]
fn test_leading_delay_applies_to_first_sound() {
    let bank = bank_with(1, |b, f| {
        let node = b.file_node(f[0], false);
        b.delay(500, Some(node))
    });
    let mut rng = StdRng::seed_from_u64(1);
    let mut cursor = cursor(&bank);
    let produced = advance(&bank, &mut cursor, &mut rng).unwrap();
    assert_eq!(produced.delay_ms, 500);
    assert!(advance(&bank, &mut cursor, &mut rng).is_none());
    assert!(cursor.is_exhausted());
}

#[test]
fn test_trailing_delay_produces_nothing() {
    let bank = bank_with(1, |b, f| {
        let node = b.file_node(f[0], false);
        let tail = b.delay(100, None);
        b.set_next(node, tail);
        node
    });
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(produce(&bank, &mut rng, 10), vec![0]);
}

#[test]
fn test_empty_group_produces_nothing() {
    let mut b = builder();
    b.add_file(pcm_info(RATE, 0, false));
    b.add_group("silent", 1.0, 0, 0, None);
    let bank = Bank::from_bytes(b.build()).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let mut cursor = cursor(&bank);
    assert!(cursor.is_exhausted());
    assert!(advance(&bank, &mut cursor, &mut rng).is_none());
}
