//! Sound resources
//!
//! [`SoundManager`] owns the bounded pools behind every playing sound: the
//! sound slots, the streaming and buffer data sources, and the fade nodes.
//! Creating a sound picks the decoder for the file's coding format, binds it
//! to a block feed, hands the source to the mixing engine and attaches a
//! fade node when the file node carries a fade filter. Any failure along the
//! way releases what was already acquired and yields no sound.
//!
//! A released sound's data source is flushed at once but only reclaimed
//! when no decode job is still running on it; until then it sits on a
//! deferred list that [`SoundManager::process_deferred`] drains.

use crate::config::RuntimeConfig;
use crate::decode::{pcm_format, Decoder, Mp3Decoder, PcmDecoder};
use crate::jobs::JobExecutor;
use crate::mix::{FadeNode, MixEngine, MixGroupId, SoundDesc, SoundId};
use crate::pool::{Handle, HandlePool};
use crate::source::{
    AudioSource, BufferSource, ChunkFeed, PooledSource, ResidentFeed, StreamingSource,
};
use crate::streaming::{ChunkCache, StreamingSourceHandle};
use crate::sync::lock;
use cue_common::bank::{CodingFormat, FadeFilterNode, FileInfo};
use cue_common::timing::ms_to_frames;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Where a file's coded bytes live
#[derive(Debug, Clone)]
pub enum FileData {
    /// `data[start..end]` is resident in memory
    Resident {
        data: Arc<[u8]>,
        start: usize,
        end: usize,
    },
    /// `size` bytes at `offset` of a registered streaming source
    Streamed {
        source: StreamingSourceHandle,
        offset: u64,
        size: u64,
    },
    /// No data could be bound at load time
    Missing,
}

/// Everything needed to create one sound
#[derive(Debug, Clone, Copy)]
pub struct SoundRequest<'a> {
    pub file_index: u32,
    pub info: FileInfo,
    pub data: &'a FileData,
    pub looping: bool,
    pub filter: Option<FadeFilterNode>,
    pub group: MixGroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceRef {
    Streaming(Handle),
    Buffer(Handle),
}

struct StreamEntry {
    source: Arc<Mutex<StreamingSource>>,
    registration: StreamingSourceHandle,
}

/// Pool slot of one created sound
#[derive(Debug, Clone, Copy)]
pub struct SoundSlot {
    pub sound: SoundId,
    pub file_index: u32,
    pub format: CodingFormat,
    source: SourceRef,
    fade: Option<Handle>,
}

pub struct SoundManager {
    sounds: HandlePool<SoundSlot>,
    streaming: HandlePool<StreamEntry>,
    buffers: HandlePool<Arc<Mutex<BufferSource>>>,
    /// Fade nodes by the sound they are attached to
    fades: HandlePool<SoundId>,
    /// Sources waiting for their decode job to finish
    deferred: Vec<SourceRef>,
    cache: Arc<ChunkCache>,
    jobs: Arc<dyn JobExecutor>,
    mp3_output_buffers: usize,
    mp3_frames_per_buffer: usize,
    resident_block_size: usize,
}

impl SoundManager {
    pub fn new(config: &RuntimeConfig, cache: Arc<ChunkCache>, jobs: Arc<dyn JobExecutor>) -> Self {
        debug!(
            "Sound pools: {} sounds, {} streaming, {} buffer, {} fade",
            config.max_sounds,
            config.max_streaming_sources,
            config.max_buffer_sources,
            config.max_fade_nodes
        );
        Self {
            sounds: HandlePool::new("sound", config.max_sounds),
            streaming: HandlePool::new("streaming source", config.max_streaming_sources),
            buffers: HandlePool::new("buffer source", config.max_buffer_sources),
            fades: HandlePool::new("fade node", config.max_fade_nodes),
            deferred: Vec::new(),
            cache,
            jobs,
            mp3_output_buffers: config.mp3_output_buffers,
            mp3_frames_per_buffer: config.mp3_frames_per_buffer,
            resident_block_size: config.resident_block_size,
        }
    }

    /// Create a stopped sound for `request` on `engine`.
    ///
    /// # Returns
    /// `None` when a pool is full, the coding format is unsupported or the
    /// engine refuses the sound; nothing stays acquired in that case
    pub fn create_sound(&mut self, engine: &dyn MixEngine, request: SoundRequest<'_>) -> Option<Handle> {
        if self.sounds.is_full() {
            warn!("Sound pool exhausted, file {} not played", request.file_index);
            return None;
        }
        if request.filter.is_some() && self.fades.is_full() {
            warn!("Fade node pool exhausted, file {} not played", request.file_index);
            return None;
        }

        let info = request.info;
        let Some(format) = info.format() else {
            warn!(
                "File {} has unsupported coding format {}",
                request.file_index, info.coding_format
            );
            return None;
        };
        let channels = info.channels.max(1) as usize;
        let decoder = self.make_decoder(format, &info, channels, request.file_index)?;
        let bytes_per_frame = format.bytes_per_sample().map(|b| b * channels);
        let frame_bytes = bytes_per_frame.unwrap_or(1);
        let frame_count = u64::from(info.frame_count);

        let (source_ref, source): (SourceRef, Box<dyn AudioSource>) = match request.data {
            FileData::Resident { data, start, end } => {
                let feed = ResidentFeed::new(
                    Arc::clone(data),
                    *start,
                    *end,
                    self.resident_block_size,
                    frame_bytes,
                );
                let shared = Arc::new(Mutex::new(BufferSource::new(
                    feed,
                    decoder,
                    channels,
                    info.sample_rate,
                    frame_count,
                    bytes_per_frame,
                )));
                let handle = self.buffers.acquire(Arc::clone(&shared))?;
                (SourceRef::Buffer(handle), Box::new(PooledSource::new(shared)))
            }
            FileData::Streamed { source, offset, size } => {
                let feed = ChunkFeed::new(Arc::clone(&self.cache), *source, *offset, *size, frame_bytes);
                let shared = Arc::new(Mutex::new(StreamingSource::new(
                    feed,
                    decoder,
                    channels,
                    info.sample_rate,
                    frame_count,
                    bytes_per_frame,
                )));
                let handle = self.streaming.acquire(StreamEntry {
                    source: Arc::clone(&shared),
                    registration: *source,
                })?;
                (SourceRef::Streaming(handle), Box::new(PooledSource::new(shared)))
            }
            FileData::Missing => {
                warn!("File {} has no data bound", request.file_index);
                return None;
            }
        };

        let desc = SoundDesc {
            volume: 1.0,
            looping: request.looping,
            loop_start: u64::from(info.loop_start),
            loop_end: u64::from(info.loop_end),
        };
        let Some(sound) = engine.create_sound(source, request.group, desc) else {
            warn!("Engine refused sound for file {}", request.file_index);
            self.retire_source(source_ref);
            return None;
        };

        let fade = match request.filter {
            Some(filter) => match self.fades.acquire(sound) {
                Some(handle) => {
                    let rate = engine.sample_rate();
                    engine.attach_filter(
                        sound,
                        Box::new(FadeNode::new(
                            ms_to_frames(u64::from(filter.start_ms), rate),
                            ms_to_frames(u64::from(filter.end_ms), rate),
                            engine.length_frames(sound),
                        )),
                    );
                    Some(handle)
                }
                None => {
                    engine.destroy_sound(sound);
                    self.retire_source(source_ref);
                    return None;
                }
            },
            None => None,
        };

        let slot = SoundSlot {
            sound,
            file_index: request.file_index,
            format,
            source: source_ref,
            fade,
        };
        match self.sounds.acquire(slot) {
            Some(handle) => {
                trace!("Sound {:?} created for file {}", handle, request.file_index);
                Some(handle)
            }
            None => {
                engine.destroy_sound(sound);
                if let Some(fade) = fade {
                    self.fades.release(fade);
                }
                self.retire_source(source_ref);
                None
            }
        }
    }

    fn make_decoder(
        &self,
        format: CodingFormat,
        info: &FileInfo,
        channels: usize,
        file_index: u32,
    ) -> Option<Decoder> {
        match format {
            CodingFormat::PcmS16 | CodingFormat::PcmF32 => {
                pcm_format(format).map(|pcm| Decoder::Pcm(PcmDecoder::new(pcm)))
            }
            CodingFormat::Mp3 => match Mp3Decoder::new(
                info.sample_rate,
                channels,
                Arc::clone(&self.jobs),
                self.mp3_output_buffers,
                self.mp3_frames_per_buffer,
            ) {
                Ok(decoder) => Some(Decoder::Mp3(decoder)),
                Err(e) => {
                    warn!("File {}: {}", file_index, e);
                    None
                }
            },
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&SoundSlot> {
        self.sounds.get(handle)
    }

    pub fn sound_id(&self, handle: Handle) -> Option<SoundId> {
        self.sounds.get(handle).map(|slot| slot.sound)
    }

    /// Destroy the engine sound and give back its resources
    pub fn release_sound(&mut self, engine: &dyn MixEngine, handle: Handle) {
        let Some(slot) = self.sounds.release(handle) else {
            return;
        };
        engine.destroy_sound(slot.sound);
        if let Some(fade) = slot.fade {
            self.fades.release(fade);
        }
        self.retire_source(slot.source);
        trace!("Sound {:?} released", handle);
    }

    /// Release every live sound
    pub fn release_all(&mut self, engine: &dyn MixEngine) {
        for handle in self.sounds.handles() {
            self.release_sound(engine, handle);
        }
    }

    fn retire_source(&mut self, source: SourceRef) {
        let in_flight = match source {
            SourceRef::Streaming(h) => self.streaming.get(h).map(|entry| {
                let mut src = lock(&entry.source);
                src.flush();
                src.decode_in_flight()
            }),
            SourceRef::Buffer(h) => self.buffers.get(h).map(|shared| {
                let mut src = lock(shared);
                src.flush();
                src.decode_in_flight()
            }),
        };
        match in_flight {
            Some(true) => {
                debug!("Source {:?} has a decode job in flight, deferring release", source);
                self.deferred.push(source);
            }
            Some(false) => self.free_source(source),
            None => {}
        }
    }

    fn free_source(&mut self, source: SourceRef) {
        match source {
            SourceRef::Streaming(h) => {
                self.streaming.release(h);
            }
            SourceRef::Buffer(h) => {
                self.buffers.release(h);
            }
        }
    }

    /// Reclaim deferred sources whose decode job has finished.
    ///
    /// # Returns
    /// Sources still waiting
    pub fn process_deferred(&mut self) -> usize {
        if self.deferred.is_empty() {
            return 0;
        }
        let pending = std::mem::take(&mut self.deferred);
        for source in pending {
            let in_flight = match source {
                SourceRef::Streaming(h) => self
                    .streaming
                    .get(h)
                    .is_some_and(|entry| lock(&entry.source).decode_in_flight()),
                SourceRef::Buffer(h) => self
                    .buffers
                    .get(h)
                    .is_some_and(|shared| lock(shared).decode_in_flight()),
            };
            if in_flight {
                self.deferred.push(source);
            } else {
                trace!("Deferred source {:?} reclaimed", source);
                self.free_source(source);
            }
        }
        self.deferred.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Some streaming source still reads through `registration`
    pub fn uses_registration(&self, registration: StreamingSourceHandle) -> bool {
        self.streaming
            .iter()
            .any(|(_, entry)| entry.registration == registration)
    }

    pub fn sound_count(&self) -> usize {
        self.sounds.len()
    }

    pub fn streaming_in_use(&self) -> usize {
        self.streaming.len()
    }

    pub fn buffers_in_use(&self) -> usize {
        self.buffers.len()
    }

    pub fn fades_in_use(&self) -> usize {
        self.fades.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::AsyncFileReader;
    use crate::jobs::InlineExecutor;
    use crate::mix::SoftMixEngine;

    fn manager(config: &RuntimeConfig) -> SoundManager {
        let reader = Arc::new(AsyncFileReader::new(config.reader_queue_capacity).unwrap());
        let cache = Arc::new(ChunkCache::new(reader, config.chunk_size, config.chunk_count));
        SoundManager::new(config, cache, Arc::new(InlineExecutor))
    }

    fn pcm_info(format: u32) -> FileInfo {
        FileInfo {
            coding_format: format,
            sample_rate: 8000,
            channels: 1,
            flags: 0,
            frame_count: 400,
            loop_start: 0,
            loop_end: 0,
            source_index: 0,
            data_offset: 0,
            data_size: 800,
        }
    }

    fn resident() -> FileData {
        let bytes: Vec<u8> = (0..400i16).flat_map(|s| (s * 10).to_le_bytes()).collect();
        let data: Arc<[u8]> = bytes.into();
        let end = data.len();
        FileData::Resident { data, start: 0, end }
    }

    #[test]
    fn test_create_and_release_resident_sound() {
        let config = RuntimeConfig::default();
        let mut sounds = manager(&config);
        let engine = SoftMixEngine::new(8000);
        let group = engine.create_group(None, 1.0).unwrap();
        let data = resident();

        let handle = sounds
            .create_sound(
                &engine,
                SoundRequest {
                    file_index: 0,
                    info: pcm_info(CodingFormat::PcmS16 as u32),
                    data: &data,
                    looping: false,
                    filter: Some(FadeFilterNode {
                        start_ms: 10,
                        end_ms: 10,
                    }),
                    group,
                },
            )
            .unwrap();
        let sound = sounds.sound_id(handle).unwrap();
        assert_eq!(engine.length_frames(sound), 400);
        assert_eq!(sounds.buffers_in_use(), 1);
        assert_eq!(sounds.fades_in_use(), 1);

        sounds.release_sound(&engine, handle);
        assert_eq!(sounds.sound_count(), 0);
        assert_eq!(sounds.buffers_in_use(), 0);
        assert_eq!(sounds.fades_in_use(), 0);
        assert_eq!(engine.sound_count(), 0);
        assert!(sounds.sound_id(handle).is_none());
    }

    #[test]
    fn test_unsupported_format_creates_nothing() {
        let config = RuntimeConfig::default();
        let mut sounds = manager(&config);
        let engine = SoftMixEngine::new(8000);
        let group = engine.create_group(None, 1.0).unwrap();
        let data = resident();

        let handle = sounds.create_sound(
            &engine,
            SoundRequest {
                file_index: 0,
                info: pcm_info(99),
                data: &data,
                looping: false,
                filter: None,
                group,
            },
        );
        assert!(handle.is_none());
        assert_eq!(sounds.buffers_in_use(), 0);
        assert_eq!(engine.sound_count(), 0);
    }

    #[test]
    fn test_full_pool_fails_quietly() {
        let config = RuntimeConfig {
            max_sounds: 1,
            ..RuntimeConfig::default()
        };
        let mut sounds = manager(&config);
        let engine = SoftMixEngine::new(8000);
        let group = engine.create_group(None, 1.0).unwrap();
        let data = resident();
        let request = SoundRequest {
            file_index: 0,
            info: pcm_info(CodingFormat::PcmS16 as u32),
            data: &data,
            looping: false,
            filter: None,
            group,
        };

        assert!(sounds.create_sound(&engine, request).is_some());
        assert!(sounds.create_sound(&engine, request).is_none());
        assert_eq!(sounds.buffers_in_use(), 1);
        assert_eq!(engine.sound_count(), 1);
    }

    #[test]
    fn test_full_fade_pool_releases_source() {
        let config = RuntimeConfig {
            max_fade_nodes: 1,
            ..RuntimeConfig::default()
        };
        let mut sounds = manager(&config);
        let engine = SoftMixEngine::new(8000);
        let group = engine.create_group(None, 1.0).unwrap();
        let data = resident();
        let request = SoundRequest {
            file_index: 0,
            info: pcm_info(CodingFormat::PcmS16 as u32),
            data: &data,
            looping: false,
            filter: Some(FadeFilterNode {
                start_ms: 0,
                end_ms: 5,
            }),
            group,
        };

        assert!(sounds.create_sound(&engine, request).is_some());
        assert!(sounds.create_sound(&engine, request).is_none());
        assert_eq!(sounds.sound_count(), 1);
        assert_eq!(sounds.buffers_in_use(), 1);
    }
}
