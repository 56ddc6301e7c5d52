//! Block feed over a resident buffer
//!
//! Blocks are zero-copy windows into the shared file data, so there is
//! nothing to release.

use super::{BlockFeed, FeedPoll};
use crate::decode::InputBuffer;
use std::sync::Arc;

pub struct ResidentFeed {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
    block_len: usize,
    /// Offset of the next block, relative to `start`
    next: usize,
}

impl ResidentFeed {
    /// Feed `data[start..end]` in blocks of `block_size` rounded down to
    /// whole `frame_bytes` frames
    pub fn new(data: Arc<[u8]>, start: usize, end: usize, block_size: usize, frame_bytes: usize) -> Self {
        let end = end.min(data.len());
        let start = start.min(end);
        let frame_bytes = frame_bytes.max(1);
        let block_len = (block_size / frame_bytes).max(1) * frame_bytes;
        Self {
            data,
            start,
            end,
            block_len,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl BlockFeed for ResidentFeed {
    fn next_block(&mut self) -> FeedPoll {
        let len = self.len();
        if self.next >= len {
            return FeedPoll::Exhausted;
        }
        let from = self.start + self.next;
        let to = (from + self.block_len).min(self.end);
        self.next = to - self.start;
        FeedPoll::Block(
            InputBuffer::new(Arc::clone(&self.data), from, to),
            self.next >= len,
        )
    }

    fn release_blocks(&mut self, _count: usize) {}

    fn restart(&mut self, byte: u64) -> u64 {
        let aligned = (byte as usize / self.block_len) * self.block_len;
        self.next = aligned.min(self.len());
        self.next as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_frame_aligned() {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 100]);
        // 10-byte request with 4-byte frames gives 8-byte blocks
        let mut feed = ResidentFeed::new(data, 4, 30, 10, 4);
        let mut sizes = Vec::new();
        let mut last_flags = Vec::new();
        while let FeedPoll::Block(block, last) = feed.next_block() {
            sizes.push(block.len());
            last_flags.push(last);
        }
        assert_eq!(sizes, vec![8, 8, 8, 2]);
        assert_eq!(last_flags, vec![false, false, false, true]);
        assert!(matches!(feed.next_block(), FeedPoll::Exhausted));
    }

    #[test]
    fn test_restart_rounds_down_to_block() {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 64]);
        let mut feed = ResidentFeed::new(data, 0, 64, 16, 2);
        assert_eq!(feed.restart(37), 32);
        match feed.next_block() {
            FeedPoll::Block(block, last) => {
                assert_eq!(block.len(), 16);
                assert!(!last);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
