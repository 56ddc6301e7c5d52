//! Streaming data path: the chunk cache that sits between decoders and the
//! async file reader

mod chunk_cache;

pub use chunk_cache::{AcquiredChunk, ChunkCache, ChunkStatus, StreamingSourceHandle};
