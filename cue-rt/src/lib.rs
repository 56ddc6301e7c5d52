//! # Cue Runtime Library (cue-rt)
//!
//! Event playback runtime: walks the sound-selection graphs of a loaded
//! event bank and turns fired events into scheduled, crossfaded sounds on a
//! mixing engine.
//!
//! Layers, leaves first:
//! - [`io`]: file-system collaborator and the background [`io::AsyncFileReader`]
//! - [`streaming`]: content-addressed chunk cache over the reader
//! - [`decode`]: pull decoders (PCM passthrough, job-driven MP3)
//! - [`source`]: decoder + block feed adapted into an [`source::AudioSource`]
//! - [`pool`]: generation-checked handle pools
//! - [`execution`]: node-execution state machine over the bank graph
//! - [`group`]: active group scheduling (crossfade, stop, pause)
//! - [`context`]: the runtime API used by a host
//! - [`mix`]: mixing-engine collaborator trait plus a software engine
//! - [`audio`]: device output and resampling for the host binary

pub mod audio;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod execution;
pub mod group;
pub mod io;
pub mod jobs;
pub mod mix;
pub mod pool;
pub mod sound;
pub mod source;
pub mod streaming;
mod sync;

pub use config::RuntimeConfig;
pub use context::{ActiveGroupInfo, BankHandle, Context, StreamingInfo, StreamingInfoProvider};
pub use error::{Error, Result};
