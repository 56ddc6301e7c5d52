//! Block feed over the chunk cache
//!
//! Each block is one cache chunk of the file's data range. The feed holds a
//! use on every chunk it has handed out until the decoder reports the block
//! consumed, and keeps one chunk acquired ahead so its read is already under
//! way when the decoder asks for it.

use super::{BlockFeed, FeedPoll};
use crate::decode::InputBuffer;
use crate::streaming::{ChunkCache, StreamingSourceHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

pub struct ChunkFeed {
    cache: Arc<ChunkCache>,
    source: StreamingSourceHandle,
    /// Start of the file's data inside the source
    base: u64,
    size: u64,
    block_len: u64,
    /// Offset of the next block, relative to `base`
    next: u64,
    /// Chunk acquired for `next`, possibly still reading
    pending: Option<u32>,
    /// Handed-out chunks, oldest first
    held: VecDeque<u32>,
}

impl ChunkFeed {
    /// Feed `size` bytes of `source` starting at `base`.
    ///
    /// Blocks are the cache chunk size rounded down to whole `frame_bytes`
    /// frames so a PCM frame never straddles two blocks.
    pub fn new(
        cache: Arc<ChunkCache>,
        source: StreamingSourceHandle,
        base: u64,
        size: u64,
        frame_bytes: usize,
    ) -> Self {
        let frame_bytes = frame_bytes.max(1) as u64;
        let block_len = ((cache.chunk_size() as u64 / frame_bytes).max(1)) * frame_bytes;
        Self {
            cache,
            source,
            base,
            size,
            block_len,
            next: 0,
            pending: None,
            held: VecDeque::new(),
        }
    }

    /// Chunks currently held (handed out or prefetched)
    pub fn held_chunks(&self) -> usize {
        self.held.len() + usize::from(self.pending.is_some())
    }

    fn acquire(&self, offset: u64) -> Option<u32> {
        self.cache
            .acquire_chunk(self.source, self.base, offset)
            .map(|chunk| chunk.index)
    }

    fn release_all(&mut self) {
        if let Some(index) = self.pending.take() {
            self.cache.release_chunk(index);
        }
        for index in self.held.drain(..) {
            self.cache.release_chunk(index);
        }
    }
}

impl BlockFeed for ChunkFeed {
    fn next_block(&mut self) -> FeedPoll {
        if self.next >= self.size {
            return FeedPoll::Exhausted;
        }

        let index = match self.pending {
            Some(index) => index,
            None => match self.acquire(self.next) {
                Some(index) => {
                    self.pending = Some(index);
                    index
                }
                None => {
                    trace!("No free chunk for offset {}", self.base + self.next);
                    return FeedPoll::Pending;
                }
            },
        };

        let Some(data) = self.cache.chunk_data(index) else {
            return FeedPoll::Pending;
        };
        self.pending = None;

        let len = self.block_len.min(self.size - self.next) as usize;
        if data.len() < len {
            warn!(
                "Short read at offset {}: {} of {} bytes, ending stream",
                self.base + self.next,
                data.len(),
                len
            );
            self.cache.release_chunk(index);
            self.next = self.size;
            return FeedPoll::Exhausted;
        }

        self.held.push_back(index);
        self.next += len as u64;
        let is_last = self.next >= self.size;
        if !is_last {
            self.pending = self.acquire(self.next);
        }

        FeedPoll::Block(InputBuffer::new(data, 0, len), is_last)
    }

    fn release_blocks(&mut self, count: usize) {
        for _ in 0..count {
            match self.held.pop_front() {
                Some(index) => self.cache.release_chunk(index),
                None => break,
            }
        }
    }

    fn restart(&mut self, byte: u64) -> u64 {
        self.release_all();
        self.next = ((byte / self.block_len) * self.block_len).min(self.size);
        self.next
    }
}

impl Drop for ChunkFeed {
    fn drop(&mut self) {
        self.release_all();
    }
}
