//! Chunk streaming cache
//!
//! A fixed pool of chunks, each holding up to `chunk_size` bytes of one
//! registered source starting at some byte offset. Chunks are found by their
//! `(source, offset)` key; a miss recycles the oldest idle chunk and issues
//! an async read for it.
//!
//! Idle chunks (use-count zero) sit on an intrusive FIFO free list. A
//! released chunk goes to the back and keeps its key, so re-acquiring it
//! before it reaches the front is still a hit. The index, the free list and
//! the source table are guarded together by one mutex.

use crate::io::{AsyncFileReader, ReadTarget, ReadToken, ReaderFileHandle};
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace};

const NIL: u32 = u32::MAX;

/// Registered streaming source; the generation catches stale handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamingSourceHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Read still outstanding
    Reading,
    /// Data available
    Ready,
}

/// Result of [`ChunkCache::acquire_chunk`]
#[derive(Debug, Clone)]
pub struct AcquiredChunk {
    pub index: u32,
    pub status: ChunkStatus,
    /// Present when `status` is `Ready`
    pub data: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChunkKey {
    source: StreamingSourceHandle,
    offset: u64,
}

struct Chunk {
    key: Option<ChunkKey>,
    use_count: u32,
    token: ReadToken,
    target: Arc<ReadTarget>,
    data: Option<Arc<[u8]>>,
    prev: u32,
    next: u32,
    idle: bool,
}

struct SourceEntry {
    generation: u32,
    file: Option<ReaderFileHandle>,
    size: u64,
}

struct CacheInner {
    chunks: Vec<Chunk>,
    index: HashMap<ChunkKey, u32>,
    free_head: u32,
    free_tail: u32,
    sources: Vec<SourceEntry>,
    free_sources: Vec<u32>,
}

impl CacheInner {
    fn unlink(&mut self, i: u32) {
        let (prev, next) = {
            let c = &self.chunks[i as usize];
            (c.prev, c.next)
        };
        if prev == NIL {
            self.free_head = next;
        } else {
            self.chunks[prev as usize].next = next;
        }
        if next == NIL {
            self.free_tail = prev;
        } else {
            self.chunks[next as usize].prev = prev;
        }
        let c = &mut self.chunks[i as usize];
        c.prev = NIL;
        c.next = NIL;
        c.idle = false;
    }

    fn push_back(&mut self, i: u32) {
        let tail = self.free_tail;
        {
            let c = &mut self.chunks[i as usize];
            c.prev = tail;
            c.next = NIL;
            c.idle = true;
        }
        if tail == NIL {
            self.free_head = i;
        } else {
            self.chunks[tail as usize].next = i;
        }
        self.free_tail = i;
    }

    fn push_front(&mut self, i: u32) {
        let head = self.free_head;
        {
            let c = &mut self.chunks[i as usize];
            c.prev = NIL;
            c.next = head;
            c.idle = true;
        }
        if head == NIL {
            self.free_tail = i;
        } else {
            self.chunks[head as usize].prev = i;
        }
        self.free_head = i;
    }

    fn source(&self, handle: StreamingSourceHandle) -> Option<&SourceEntry> {
        let entry = self.sources.get(handle.index as usize)?;
        if entry.generation != handle.generation || entry.file.is_none() {
            debug_assert!(false, "stale streaming source handle {:?}", handle);
            error!("Stale streaming source handle {:?}", handle);
            return None;
        }
        Some(entry)
    }
}

/// Content-addressed, reference-counted chunk pool over the async reader
pub struct ChunkCache {
    reader: Arc<AsyncFileReader>,
    chunk_size: usize,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    /// Create a cache of `chunk_count` chunks of `chunk_size` bytes
    pub fn new(reader: Arc<AsyncFileReader>, chunk_size: usize, chunk_count: usize) -> Self {
        let mut inner = CacheInner {
            chunks: Vec::with_capacity(chunk_count),
            index: HashMap::with_capacity(chunk_count),
            free_head: NIL,
            free_tail: NIL,
            sources: Vec::new(),
            free_sources: Vec::new(),
        };
        for i in 0..chunk_count as u32 {
            inner.chunks.push(Chunk {
                key: None,
                use_count: 0,
                token: 0,
                target: ReadTarget::new(),
                data: None,
                prev: NIL,
                next: NIL,
                idle: false,
            });
            inner.push_back(i);
        }

        debug!(
            "Chunk cache created: {} chunks of {} bytes",
            chunk_count, chunk_size
        );

        Self {
            reader,
            chunk_size,
            inner: Mutex::new(inner),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn reader(&self) -> &Arc<AsyncFileReader> {
        &self.reader
    }

    /// Register a reader file of `size` bytes as a source
    pub fn register_source(&self, file: ReaderFileHandle, size: u64) -> StreamingSourceHandle {
        let mut inner = lock(&self.inner);
        let index = match inner.free_sources.pop() {
            Some(index) => {
                let entry = &mut inner.sources[index as usize];
                entry.file = Some(file);
                entry.size = size;
                index
            }
            None => {
                inner.sources.push(SourceEntry {
                    generation: 0,
                    file: Some(file),
                    size,
                });
                inner.sources.len() as u32 - 1
            }
        };
        let generation = inner.sources[index as usize].generation;
        debug!("Streaming source {} registered ({} bytes)", index, size);
        StreamingSourceHandle { index, generation }
    }

    /// Drop a source and every idle chunk keyed to it.
    ///
    /// Returns the reader file so the caller can close it. Chunks of the
    /// source that are still in use are a caller bug and keep their key
    /// until released.
    pub fn deregister_source(&self, handle: StreamingSourceHandle) -> Option<ReaderFileHandle> {
        let mut inner = lock(&self.inner);
        inner.source(handle)?;

        let stale: Vec<u32> = inner
            .index
            .iter()
            .filter(|(key, _)| key.source == handle)
            .map(|(_, &i)| i)
            .collect();
        for i in stale {
            if inner.chunks[i as usize].use_count > 0 {
                error!(
                    "Chunk {} of source {:?} still in use at deregistration",
                    i, handle
                );
                continue;
            }
            if let Some(key) = inner.chunks[i as usize].key.take() {
                inner.index.remove(&key);
            }
            inner.chunks[i as usize].data = None;
            inner.chunks[i as usize].target = ReadTarget::new();
            // Keyless chunks are the cheapest to reuse
            inner.unlink(i);
            inner.push_front(i);
        }

        let entry = &mut inner.sources[handle.index as usize];
        entry.generation = entry.generation.wrapping_add(1);
        let file = entry.file.take();
        inner.free_sources.push(handle.index);
        debug!("Streaming source {} deregistered", handle.index);
        file
    }

    /// Size in bytes of a registered source
    pub fn source_size(&self, handle: StreamingSourceHandle) -> Option<u64> {
        lock(&self.inner).source(handle).map(|s| s.size)
    }

    /// Acquire the chunk holding `base_offset + block_offset` of `source`.
    ///
    /// Hits bump the use-count (detaching an idle chunk from the free list);
    /// misses recycle the oldest idle chunk and start a read for it.
    ///
    /// # Returns
    /// `None` when every chunk is in use or the handle is stale
    pub fn acquire_chunk(
        &self,
        source: StreamingSourceHandle,
        base_offset: u64,
        block_offset: u64,
    ) -> Option<AcquiredChunk> {
        let offset = base_offset + block_offset;
        let key = ChunkKey { source, offset };
        let mut inner = lock(&self.inner);

        if let Some(&i) = inner.index.get(&key) {
            if inner.chunks[i as usize].idle {
                inner.unlink(i);
            }
            inner.chunks[i as usize].use_count += 1;
            let (status, data) = self.poll(&mut inner.chunks[i as usize]);
            trace!("Chunk hit {} for offset {} ({:?})", i, offset, status);
            return Some(AcquiredChunk {
                index: i,
                status,
                data,
            });
        }

        let (file, size) = {
            let entry = inner.source(source)?;
            (entry.file?, entry.size)
        };

        let i = inner.free_head;
        if i == NIL {
            trace!("Chunk cache exhausted");
            return None;
        }
        inner.unlink(i);
        if let Some(old) = inner.chunks[i as usize].key.take() {
            inner.index.remove(&old);
        }
        inner.index.insert(key, i);

        let len = size.saturating_sub(offset).min(self.chunk_size as u64) as usize;
        let target = ReadTarget::new();
        let token = self.reader.request_read(file, offset, len, Arc::clone(&target));

        let chunk = &mut inner.chunks[i as usize];
        chunk.key = Some(key);
        chunk.use_count = 1;
        chunk.token = token;
        chunk.target = target;
        chunk.data = None;
        trace!("Chunk miss {} for offset {}, read token {}", i, offset, token);

        Some(AcquiredChunk {
            index: i,
            status: ChunkStatus::Reading,
            data: None,
        })
    }

    /// Drop one use; at zero the chunk goes to the back of the free list
    pub fn release_chunk(&self, index: u32) {
        let mut inner = lock(&self.inner);
        let Some(chunk) = inner.chunks.get_mut(index as usize) else {
            error!("Release of unknown chunk {}", index);
            return;
        };
        if chunk.use_count == 0 {
            debug_assert!(false, "chunk {} released more often than acquired", index);
            error!("Chunk {} released more often than acquired", index);
            return;
        }
        chunk.use_count -= 1;
        if chunk.use_count == 0 {
            inner.push_back(index);
        }
    }

    pub fn chunk_status(&self, index: u32) -> ChunkStatus {
        let mut inner = lock(&self.inner);
        match inner.chunks.get_mut(index as usize) {
            Some(chunk) => self.poll(chunk).0,
            None => ChunkStatus::Reading,
        }
    }

    /// Chunk bytes once the read has completed
    pub fn chunk_data(&self, index: u32) -> Option<Arc<[u8]>> {
        let mut inner = lock(&self.inner);
        let chunk = inner.chunks.get_mut(index as usize)?;
        self.poll(chunk).1
    }

    /// Current use-count of a chunk
    pub fn use_count(&self, index: u32) -> u32 {
        lock(&self.inner)
            .chunks
            .get(index as usize)
            .map_or(0, |c| c.use_count)
    }

    /// Chunks currently on the free list
    pub fn idle_chunks(&self) -> usize {
        lock(&self.inner).chunks.iter().filter(|c| c.idle).count()
    }

    fn poll(&self, chunk: &mut Chunk) -> (ChunkStatus, Option<Arc<[u8]>>) {
        if chunk.data.is_none() {
            if self.reader.check_request_running(chunk.token) {
                return (ChunkStatus::Reading, None);
            }
            chunk.data = chunk.target.data();
        }
        match &chunk.data {
            Some(data) => (ChunkStatus::Ready, Some(Arc::clone(data))),
            None => (ChunkStatus::Reading, None),
        }
    }
}
