//! Runtime context
//!
//! [`Context`] is the surface a host drives: load and unload event banks,
//! fire events, tick [`Context::process_frame`] from its control loop, set
//! bus and main volumes, and list the active groups.
//!
//! The context owns the async reader, the chunk cache, the sound pools, the
//! loaded banks and the active groups. All of it is single-writer: only the
//! thread holding `&mut Context` acquires or releases resources. The mixing
//! engine and the decode jobs run on their own threads and only ever touch
//! the data sources and the chunk cache.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::group::{ActiveGroup, GroupEnv, GroupState};
use crate::io::{AsyncFileReader, FileSystem, ReadToken, ReaderFileHandle};
use crate::jobs::JobExecutor;
use crate::mix::{MixEngine, MixGroupId};
use crate::pool::{Handle, HandlePool};
use crate::sound::{FileData, SoundManager};
use crate::streaming::{ChunkCache, StreamingSourceHandle};
use cue_common::bank::{Action, ActionKind, Bank};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Loaded bank reference
pub type BankHandle = Handle;

/// Where a streamed file's bytes live, as reported by an authoring tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingInfo {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// Authoring hook consulted for streamed files when a bank has no baked
/// streaming section
pub trait StreamingInfoProvider: Send {
    fn streaming_info(&self, file_index: u32) -> Option<StreamingInfo>;
}

/// Snapshot of one active group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveGroupInfo {
    pub bank: BankHandle,
    pub group_index: u32,
    pub name: Option<String>,
    pub object_id: u64,
    pub bus_index: u32,
    pub state: GroupState,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    source: StreamingSourceHandle,
    file: ReaderFileHandle,
}

struct LoadedBank {
    bank: Bank,
    files: Vec<FileData>,
    registrations: Vec<Registration>,
    bus_groups: Vec<MixGroupId>,
}

/// Registrations of an unloaded bank waiting for their last reader
struct PendingUnload {
    registrations: Vec<Registration>,
    close_tokens: Vec<ReadToken>,
}

pub struct Context {
    engine: Arc<dyn MixEngine>,
    fs: Arc<dyn FileSystem>,
    reader: Arc<AsyncFileReader>,
    cache: Arc<ChunkCache>,
    sounds: SoundManager,
    banks: HandlePool<LoadedBank>,
    groups: HandlePool<ActiveGroup>,
    unloading: Vec<PendingUnload>,
    rng: StdRng,
    provider: Option<Box<dyn StreamingInfoProvider>>,
}

impl Context {
    /// Create a runtime on top of the given collaborators.
    ///
    /// # Errors
    /// Invalid configuration, or the reader thread could not be started
    pub fn new(
        config: RuntimeConfig,
        engine: Arc<dyn MixEngine>,
        fs: Arc<dyn FileSystem>,
        jobs: Arc<dyn JobExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        if engine.sample_rate() != config.output_sample_rate {
            warn!(
                "Engine runs at {} Hz, configured output rate is {} Hz; using the engine rate",
                engine.sample_rate(),
                config.output_sample_rate
            );
        }

        let reader = Arc::new(AsyncFileReader::new(config.reader_queue_capacity)?);
        let cache = Arc::new(ChunkCache::new(
            Arc::clone(&reader),
            config.chunk_size,
            config.chunk_count,
        ));
        let sounds = SoundManager::new(&config, Arc::clone(&cache), jobs);
        let rng = match config.random_seed {
            Some(seed) => {
                debug!("Random nodes seeded with {}", seed);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };

        info!(
            "Context created: {} Hz, {} chunks of {} bytes",
            engine.sample_rate(),
            config.chunk_count,
            config.chunk_size
        );

        Ok(Self {
            engine,
            fs,
            reader,
            cache,
            sounds,
            banks: HandlePool::new("bank", config.max_banks),
            groups: HandlePool::new("active group", config.max_active_groups),
            unloading: Vec::new(),
            rng,
            provider: None,
        })
    }

    pub fn set_streaming_info_provider(&mut self, provider: Box<dyn StreamingInfoProvider>) {
        self.provider = Some(provider);
    }

    pub fn engine(&self) -> &Arc<dyn MixEngine> {
        &self.engine
    }

    pub fn sounds(&self) -> &SoundManager {
        &self.sounds
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn bank(&self, handle: BankHandle) -> Option<&Bank> {
        self.banks.get(handle).map(|loaded| &loaded.bank)
    }

    /// Unloaded banks whose files are not closed yet
    pub fn pending_unloads(&self) -> usize {
        self.unloading.len()
    }

    /// Load a bank file.
    ///
    /// Audio comes from the bank's stream sources (paths relative to the
    /// bank's directory) when it has any, else from the streaming info
    /// provider for streamed files, else from `data_path`. Streamed files
    /// are registered with the chunk cache; the rest are read into memory.
    ///
    /// # Errors
    /// Unreadable files, malformed bank or version mismatch, bank table
    /// full. Nothing stays registered on failure.
    pub fn load_bank(&mut self, bank_path: &Path, data_path: Option<&Path>) -> Result<BankHandle> {
        if self.banks.is_full() {
            return Err(Error::Resource(format!(
                "bank table full ({} banks)",
                self.banks.capacity()
            )));
        }

        let bank = Bank::from_bytes(self.fs.read_all(bank_path)?)?;
        let bank_dir = bank_path.parent().unwrap_or_else(|| Path::new(""));

        let mut registrations = Vec::new();
        let files = match self.bind_files(&bank, bank_dir, data_path, &mut registrations) {
            Ok(files) => files,
            Err(e) => {
                self.close_registrations(&registrations);
                return Err(e);
            }
        };

        let handle = self.install(bank, files, registrations)?;
        info!("Bank {} loaded as {:?}", bank_path.display(), handle);
        Ok(handle)
    }

    /// Load a bank from memory; every file plays from `data` regardless of
    /// its stream flag.
    ///
    /// # Errors
    /// Malformed bank, a file range outside `data`, or bank table full
    pub fn load_bank_from_memory(
        &mut self,
        bank_bytes: impl Into<Box<[u8]>>,
        data: Arc<[u8]>,
    ) -> Result<BankHandle> {
        if self.banks.is_full() {
            return Err(Error::Resource(format!(
                "bank table full ({} banks)",
                self.banks.capacity()
            )));
        }

        let bank = Bank::from_bytes(bank_bytes)?;
        let mut files = Vec::with_capacity(bank.file_count() as usize);
        for index in 0..bank.file_count() {
            let info = bank
                .file(index)
                .ok_or_else(|| cue_common::Error::BankFormat(format!("file {} unreadable", index)))?;
            let start = info.data_offset as usize;
            let end = start + info.data_size as usize;
            if end > data.len() {
                return Err(cue_common::Error::BankFormat(format!(
                    "file {} data [{}, {}) outside {}-byte buffer",
                    index,
                    start,
                    end,
                    data.len()
                ))
                .into());
            }
            files.push(FileData::Resident {
                data: Arc::clone(&data),
                start,
                end,
            });
        }

        let handle = self.install(bank, files, Vec::new())?;
        info!("Bank loaded from memory as {:?}", handle);
        Ok(handle)
    }

    fn install(
        &mut self,
        bank: Bank,
        files: Vec<FileData>,
        registrations: Vec<Registration>,
    ) -> Result<BankHandle> {
        let mut bus_groups = Vec::with_capacity(bank.bus_count() as usize);
        for index in 0..bank.bus_count() {
            let volume = bank.bus(index).map_or(1.0, |bus| bus.volume);
            match self.engine.create_group(None, volume) {
                Some(group) => bus_groups.push(group),
                None => {
                    bus_groups.iter().for_each(|g| self.engine.destroy_group(*g));
                    self.close_registrations(&registrations);
                    return Err(Error::Resource(format!("no mix group for bus {}", index)));
                }
            }
        }

        let loaded = LoadedBank {
            bank,
            files,
            registrations,
            bus_groups,
        };
        match self.banks.acquire(loaded) {
            Some(handle) => Ok(handle),
            None => Err(Error::Resource("bank table full".to_string())),
        }
    }

    fn bind_files(
        &mut self,
        bank: &Bank,
        bank_dir: &Path,
        data_path: Option<&Path>,
        registrations: &mut Vec<Registration>,
    ) -> Result<Vec<FileData>> {
        let baked = bank.stream_source_count() > 0;
        let mut by_path: HashMap<PathBuf, StreamingSourceHandle> = HashMap::new();
        let mut files = Vec::with_capacity(bank.file_count() as usize);

        for index in 0..bank.file_count() {
            let Some(info) = bank.file(index) else {
                files.push(FileData::Missing);
                continue;
            };

            let location = if baked {
                bank.stream_source_path(info.source_index).map(|path| StreamingInfo {
                    path: bank_dir.join(path),
                    offset: u64::from(info.data_offset),
                    size: u64::from(info.data_size),
                })
            } else {
                let hooked = if info.is_streamed() {
                    self.provider
                        .as_ref()
                        .and_then(|provider| provider.streaming_info(index))
                } else {
                    None
                };
                hooked.or_else(|| {
                    data_path.map(|path| StreamingInfo {
                        path: path.to_path_buf(),
                        offset: u64::from(info.data_offset),
                        size: u64::from(info.data_size),
                    })
                })
            };

            let Some(location) = location else {
                warn!("File {} has no data location", index);
                files.push(FileData::Missing);
                continue;
            };

            if info.is_streamed() {
                let source = match by_path.get(&location.path) {
                    Some(source) => *source,
                    None => {
                        let registration = self.register(&location.path)?;
                        registrations.push(registration);
                        by_path.insert(location.path.clone(), registration.source);
                        registration.source
                    }
                };
                files.push(FileData::Streamed {
                    source,
                    offset: location.offset,
                    size: location.size,
                });
            } else {
                let bytes = self
                    .fs
                    .read_range(&location.path, location.offset, location.size as usize)?;
                let end = bytes.len();
                files.push(FileData::Resident {
                    data: bytes.into(),
                    start: 0,
                    end,
                });
            }
        }

        Ok(files)
    }

    fn register(&self, path: &Path) -> Result<Registration> {
        let mut handle = self.fs.open(path)?;
        let size = handle.size()?;
        let file = self.reader.start_async_reading(handle);
        let source = self.cache.register_source(file, size);
        debug!("Streaming {} ({} bytes)", path.display(), size);
        Ok(Registration { source, file })
    }

    fn close_registrations(&self, registrations: &[Registration]) {
        for registration in registrations {
            if let Some(file) = self.cache.deregister_source(registration.source) {
                self.reader.stop_async_reading(file);
            }
        }
    }

    /// Stop everything the bank plays and release it.
    ///
    /// Sounds are released at once (those with a decode job in flight are
    /// reclaimed later); streaming registrations are closed once no source
    /// reads through them.
    ///
    /// # Returns
    /// `false` for an unknown handle
    pub fn unload_bank(&mut self, handle: BankHandle) -> bool {
        let Some(loaded) = self.banks.release(handle) else {
            return false;
        };

        for group in self.groups.handles() {
            if self.groups.get(group).is_some_and(|g| g.bank() == handle) {
                if let Some(active) = self.groups.release(group) {
                    active.release(&mut self.sounds, &*self.engine);
                }
            }
        }
        for bus in &loaded.bus_groups {
            self.engine.destroy_group(*bus);
        }

        if !loaded.registrations.is_empty() {
            self.unloading.push(PendingUnload {
                registrations: loaded.registrations,
                close_tokens: Vec::new(),
            });
        }
        self.finish_unloads();
        info!("Bank {:?} unloaded", handle);
        true
    }

    /// Close registrations nothing reads through anymore
    fn finish_unloads(&mut self) {
        let sounds = &self.sounds;
        let cache = &self.cache;
        let reader = &self.reader;
        self.unloading.retain_mut(|pending| {
            pending.registrations.retain(|registration| {
                if sounds.uses_registration(registration.source) {
                    return true;
                }
                if let Some(file) = cache.deregister_source(registration.source) {
                    pending.close_tokens.push(reader.stop_async_reading(file));
                }
                false
            });
            pending
                .close_tokens
                .retain(|token| reader.check_request_running(*token));
            !pending.registrations.is_empty() || !pending.close_tokens.is_empty()
        });
    }

    /// Advance every active group: promote finished sounds, pre-roll the
    /// next ones, release stopped instances. Never blocks on I/O or decode
    /// work.
    pub fn process_frame(&mut self) {
        self.sounds.process_deferred();

        for handle in self.groups.handles() {
            let alive = {
                let Some(active) = self.groups.get_mut(handle) else {
                    continue;
                };
                match self.banks.get(active.bank()) {
                    Some(loaded) => {
                        let mut env = GroupEnv {
                            bank: &loaded.bank,
                            files: &loaded.files,
                            sounds: &mut self.sounds,
                            engine: &*self.engine,
                            rng: &mut self.rng,
                        };
                        active.process(&mut env)
                    }
                    None => false,
                }
            };
            if !alive {
                if let Some(active) = self.groups.release(handle) {
                    trace!("Active group {:?} released", handle);
                    active.release(&mut self.sounds, &*self.engine);
                }
            }
        }

        if !self.unloading.is_empty() {
            self.finish_unloads();
        }
    }

    /// Fire the event `name` of `bank` for `object_id`.
    ///
    /// # Returns
    /// `false` when the bank or event is unknown (nothing happens)
    pub fn fire_event(&mut self, bank: BankHandle, name: &str, object_id: u64) -> bool {
        let actions = {
            let Some(loaded) = self.banks.get(bank) else {
                warn!("Event '{}' fired on unknown bank {:?}", name, bank);
                return false;
            };
            let Some(index) = loaded.bank.find_event(name) else {
                debug!("Event '{}' not found", name);
                return false;
            };
            loaded.bank.event_actions(index)
        };
        trace!("Event '{}' for object {}: {} actions", name, object_id, actions.len());
        self.fire_actions(bank, &actions, object_id);
        true
    }

    /// Run a list of actions directly
    pub fn fire_actions(&mut self, bank: BankHandle, actions: &[Action], object_id: u64) {
        for action in actions {
            self.apply(bank, *action, object_id);
        }
    }

    fn apply(&mut self, bank: BankHandle, action: Action, object_id: u64) {
        let target = action.target_index;
        let fade = action.fade_ms;
        match action.kind {
            ActionKind::None => {}
            ActionKind::Play => self.play(bank, target, object_id, fade, false),
            ActionKind::PlaySingle => self.play(bank, target, object_id, fade, true),
            ActionKind::Stop => self.apply_to_groups(
                bank,
                |g| g.group_index() == target && g.object_id() == object_id,
                |g, env| g.stop(env.engine, fade),
            ),
            ActionKind::BreakLoop => self.apply_to_groups(
                bank,
                |g| g.group_index() == target && g.object_id() == object_id,
                |g, env| g.break_loop(env),
            ),
            ActionKind::Pause => self.apply_to_groups(
                bank,
                |g| g.group_index() == target && g.object_id() == object_id,
                |g, env| g.pause(env.engine, fade),
            ),
            ActionKind::Resume => self.apply_to_groups(
                bank,
                |g| g.group_index() == target && g.object_id() == object_id,
                |g, env| g.resume(env, fade),
            ),
            ActionKind::PauseBus => self.apply_to_groups(
                bank,
                |g| g.bus_index() == target,
                |g, env| g.pause(env.engine, fade),
            ),
            ActionKind::ResumeBus => self.apply_to_groups(
                bank,
                |g| g.bus_index() == target,
                |g, env| g.resume(env, fade),
            ),
            ActionKind::StopBus => self.apply_to_groups(
                bank,
                |g| g.bus_index() == target,
                |g, env| g.stop(env.engine, fade),
            ),
            ActionKind::StopAll => self.apply_to_groups(bank, |_| true, |g, env| g.stop(env.engine, fade)),
        }
    }

    fn apply_to_groups<P, F>(&mut self, bank: BankHandle, pred: P, mut op: F)
    where
        P: Fn(&ActiveGroup) -> bool,
        F: FnMut(&mut ActiveGroup, &mut GroupEnv<'_>),
    {
        let Some(loaded) = self.banks.get(bank) else {
            return;
        };
        let mut env = GroupEnv {
            bank: &loaded.bank,
            files: &loaded.files,
            sounds: &mut self.sounds,
            engine: &*self.engine,
            rng: &mut self.rng,
        };
        for handle in self.groups.handles() {
            if let Some(active) = self.groups.get_mut(handle) {
                if active.bank() == bank && pred(active) {
                    op(active, &mut env);
                }
            }
        }
    }

    fn play(&mut self, bank: BankHandle, group_index: u32, object_id: u64, fade_ms: u32, single: bool) {
        if single
            && self.groups.iter().any(|(_, g)| {
                g.matches(bank, group_index, object_id) && g.state() != GroupState::Stopped
            })
        {
            trace!("Group {} already active for object {}", group_index, object_id);
            return;
        }
        if self.groups.is_full() {
            warn!(
                "Active group table full ({}), group {} not played",
                self.groups.capacity(),
                group_index
            );
            return;
        }

        let active = {
            let Some(loaded) = self.banks.get(bank) else {
                return;
            };
            let Some(group) = loaded.bank.group(group_index) else {
                warn!("Play of unknown group {}", group_index);
                return;
            };
            let Some(&bus) = loaded.bus_groups.get(group.bus_index as usize) else {
                return;
            };
            let mut env = GroupEnv {
                bank: &loaded.bank,
                files: &loaded.files,
                sounds: &mut self.sounds,
                engine: &*self.engine,
                rng: &mut self.rng,
            };
            ActiveGroup::start(&mut env, bank, group_index, object_id, bus, fade_ms)
        };

        if let Some(active) = active {
            self.groups.acquire(active);
        }
    }

    /// # Returns
    /// `false` for an unknown bank or bus
    pub fn set_bus_volume(&mut self, bank: BankHandle, bus_index: u32, volume: f32) -> bool {
        let Some(bus) = self
            .banks
            .get(bank)
            .and_then(|loaded| loaded.bus_groups.get(bus_index as usize).copied())
        else {
            return false;
        };
        self.engine.set_group_volume(bus, volume);
        true
    }

    pub fn set_main_volume(&mut self, volume: f32) {
        self.engine.set_master_volume(volume);
    }

    pub fn active_groups(&self) -> Vec<ActiveGroupInfo> {
        self.groups
            .iter()
            .map(|(_, g)| ActiveGroupInfo {
                bank: g.bank(),
                group_index: g.group_index(),
                name: self
                    .banks
                    .get(g.bank())
                    .and_then(|loaded| loaded.bank.group_name(g.group_index()))
                    .map(str::to_string),
                object_id: g.object_id(),
                bus_index: g.bus_index(),
                state: g.state(),
                paused: g.is_paused(),
            })
            .collect()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for handle in self.groups.handles() {
            if let Some(active) = self.groups.release(handle) {
                active.release(&mut self.sounds, &*self.engine);
            }
        }
        self.sounds.release_all(&*self.engine);

        let mut registrations = Vec::new();
        for handle in self.banks.handles() {
            if let Some(loaded) = self.banks.release(handle) {
                loaded.bus_groups.iter().for_each(|g| self.engine.destroy_group(*g));
                registrations.extend(loaded.registrations);
            }
        }
        for pending in self.unloading.drain(..) {
            registrations.extend(pending.registrations);
        }
        self.close_registrations(&registrations);
        debug!("Context dropped");
    }
}
