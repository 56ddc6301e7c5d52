//! # Cue Common Library
//!
//! Shared code for the cue event playback runtime and its tooling:
//! - Error types
//! - Tick-based timing conversions between milliseconds, ticks and frames
//! - Event bank binary format (validated reader and builder)
//! - Configuration file resolution

pub mod bank;
pub mod config;
pub mod error;
pub mod timing;

pub use bank::{Bank, BankBuilder};
pub use error::{Error, Result};
