//! Node execution over a bank's sound-selection graph
//!
//! An [`ExecutionCursor`] remembers where a group instance is in its graph:
//! the node to descend into next, the delay accumulated since the last
//! produced file, and a stack of frames for the stateful nodes (sequence
//! cursor, repeat counter) on the path to the last produced file.
//!
//! [`advance`] walks from the cursor until it reaches a file node or the
//! graph is exhausted. Random and delay nodes are stateless and never push a
//! frame.

use cue_common::bank::{Bank, FileNode, NodeDesc, NodeKind};
use rand::Rng;
use tracing::{trace, warn};

/// Node resolutions allowed in one `advance` call before the graph is
/// treated as producing nothing (e.g. an infinite repeat of an empty list)
const MAX_VISITS: usize = 1024;

/// Activation of a stateful node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionFrame {
    pub node: NodeDesc,
    /// Sequence: next child index. Repeat: iterations started.
    pub state: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionCursor {
    next: Option<NodeDesc>,
    delay_ms: u64,
    stack: Vec<ExecutionFrame>,
}

impl ExecutionCursor {
    /// Cursor positioned before a group's first node
    pub fn new(first: NodeDesc) -> Self {
        Self {
            next: first.some(),
            delay_ms: 0,
            stack: Vec::new(),
        }
    }

    /// Stateful ancestors of the last produced file
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none() && self.stack.is_empty()
    }
}

/// A file node reached by [`advance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducedSound {
    /// Bank offset of the file node
    pub node_offset: u32,
    pub file: FileNode,
    /// Delay to add to this sound's start
    pub delay_ms: u64,
}

/// Advance `cursor` to the next file node.
///
/// # Returns
/// The produced file, or `None` once the graph is exhausted
pub fn advance<R>(bank: &Bank, cursor: &mut ExecutionCursor, rng: &mut R) -> Option<ProducedSound>
where
    R: Rng + ?Sized,
{
    for _ in 0..MAX_VISITS {
        // A node taken from `next` is entered for the first time; otherwise
        // control returns to the innermost stateful ancestor
        let (node, first_visit) = match cursor.next.take() {
            Some(node) => (node, true),
            None => match cursor.stack.last() {
                Some(frame) => (frame.node, false),
                None => return None,
            },
        };

        match node.kind {
            NodeKind::File => {
                let Some(file) = bank.file_node(node.offset) else {
                    warn!("File node at {} out of range", node.offset);
                    continue;
                };
                cursor.next = file.next.some();
                let delay_ms = std::mem::take(&mut cursor.delay_ms);
                trace!("Produced file {} (delay {}ms)", file.file_index, delay_ms);
                return Some(ProducedSound {
                    node_offset: node.offset,
                    file,
                    delay_ms,
                });
            }
            NodeKind::Random => {
                let Some(children) = bank.list_children(node) else {
                    continue;
                };
                if children.is_empty() {
                    continue;
                }
                let pick = rng.gen_range(0..children.len());
                cursor.next = children.get(pick).and_then(NodeDesc::some);
            }
            NodeKind::Sequence => {
                if first_visit {
                    cursor.stack.push(ExecutionFrame { node, state: 0 });
                }
                let len = bank.list_children(node).map_or(0, |c| c.len());
                let Some(frame) = cursor.stack.last_mut() else {
                    return None;
                };
                if frame.state < len {
                    let child = bank
                        .list_children(node)
                        .and_then(|c| c.get(frame.state))
                        .and_then(NodeDesc::some);
                    frame.state += 1;
                    cursor.next = child;
                } else {
                    cursor.stack.pop();
                }
            }
            NodeKind::Repeat => {
                let Some(repeat) = bank.repeat_node(node.offset) else {
                    warn!("Repeat node at {} out of range", node.offset);
                    if !first_visit {
                        cursor.stack.pop();
                    }
                    continue;
                };
                if first_visit {
                    cursor.stack.push(ExecutionFrame { node, state: 0 });
                }
                let Some(frame) = cursor.stack.last_mut() else {
                    return None;
                };
                if repeat.repeat_count != 0 && frame.state >= repeat.repeat_count {
                    cursor.stack.pop();
                } else {
                    frame.state = frame.state.saturating_add(1);
                    cursor.next = repeat.child.some();
                }
            }
            NodeKind::Delay => {
                let Some(delay) = bank.delay_node(node.offset) else {
                    warn!("Delay node at {} out of range", node.offset);
                    continue;
                };
                cursor.delay_ms += u64::from(delay.time_ms);
                cursor.next = delay.next.some();
            }
            NodeKind::None => {}
        }
    }

    warn!("Node graph produced no file after {} visits", MAX_VISITS);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use cue_common::bank::{BankBuilder, CodingFormat, FileInfo};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pcm_file() -> FileInfo {
        FileInfo {
            coding_format: CodingFormat::PcmS16 as u32,
            sample_rate: 8000,
            channels: 1,
            flags: 0,
            frame_count: 100,
            loop_start: 0,
            loop_end: 0,
            source_index: 0,
            data_offset: 0,
            data_size: 200,
        }
    }

    fn builder() -> BankBuilder {
        let mut b = BankBuilder::new();
        b.add_bus("main", 1.0);
        b
    }

    fn first_node(bank: &Bank) -> NodeDesc {
        bank.group(0).unwrap().first_node
    }

    #[test]
    fn test_file_chain_follows_next() {
        let mut b = builder();
        let f0 = b.add_file(pcm_file());
        let f1 = b.add_file(pcm_file());
        let second = b.file_node(f1, false);
        let first = b.file_node(f0, false);
        b.set_next(first, second);
        b.add_group("chain", 1.0, 0, 0, Some(first));
        let bank = Bank::from_bytes(b.build()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let mut cursor = ExecutionCursor::new(first_node(&bank));
        assert_eq!(advance(&bank, &mut cursor, &mut rng).unwrap().file.file_index, f0);
        assert_eq!(advance(&bank, &mut cursor, &mut rng).unwrap().file.file_index, f1);
        assert!(advance(&bank, &mut cursor, &mut rng).is_none());
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_sequence_inside_repeat_keeps_frames() {
        let mut b = builder();
        let f0 = b.add_file(pcm_file());
        let f1 = b.add_file(pcm_file());
        let a = b.file_node(f0, false);
        let c = b.file_node(f1, false);
        let seq = b.sequence(vec![a, c]);
        let rep = b.repeat(2, seq);
        b.add_group("g", 1.0, 0, 0, Some(rep));
        let bank = Bank::from_bytes(b.build()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let mut cursor = ExecutionCursor::new(first_node(&bank));
        let mut order = Vec::new();
        while let Some(produced) = advance(&bank, &mut cursor, &mut rng) {
            assert_eq!(cursor.depth(), 2);
            order.push(produced.file.file_index);
        }
        assert_eq!(order, vec![f0, f1, f0, f1]);
        assert_eq!(cursor.depth(), 0);
    }

    #[test]
    fn test_random_does_not_push_a_frame() {
        let mut b = builder();
        let f0 = b.add_file(pcm_file());
        let f1 = b.add_file(pcm_file());
        let a = b.file_node(f0, false);
        let c = b.file_node(f1, false);
        let rnd = b.random(vec![a, c]);
        b.add_group("g", 1.0, 0, 0, Some(rnd));
        let bank = Bank::from_bytes(b.build()).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let mut cursor = ExecutionCursor::new(first_node(&bank));
        let produced = advance(&bank, &mut cursor, &mut rng).unwrap();
        assert!(produced.file.file_index == f0 || produced.file.file_index == f1);
        assert_eq!(cursor.depth(), 0);
        assert!(advance(&bank, &mut cursor, &mut rng).is_none());
    }

    #[test]
    fn test_delays_accumulate_then_reset() {
        let mut b = builder();
        let f0 = b.add_file(pcm_file());
        let tail = b.file_node(f0, false);
        let inner = b.delay(50, Some(tail));
        let outer = b.delay(25, Some(inner));
        let head = b.file_node(f0, false);
        b.set_next(head, outer);
        b.add_group("g", 1.0, 0, 0, Some(head));
        let bank = Bank::from_bytes(b.build()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let mut cursor = ExecutionCursor::new(first_node(&bank));
        assert_eq!(advance(&bank, &mut cursor, &mut rng).unwrap().delay_ms, 0);
        assert_eq!(advance(&bank, &mut cursor, &mut rng).unwrap().delay_ms, 75);
        assert!(advance(&bank, &mut cursor, &mut rng).is_none());
    }

    #[test]
    fn test_infinite_repeat_of_empty_sequence_terminates() {
        let mut b = builder();
        let empty = b.sequence(Vec::new());
        let rep = b.repeat(0, empty);
        b.add_group("g", 1.0, 0, 0, Some(rep));
        let bank = Bank::from_bytes(b.build()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let mut cursor = ExecutionCursor::new(first_node(&bank));
        assert!(advance(&bank, &mut cursor, &mut rng).is_none());
    }
}
