//! cue-rt runtime configuration
//!
//! Every field has a built-in default, so an empty or missing config file
//! yields a working runtime. Loaded from TOML through the resolution order in
//! [`cue_common::config`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Runtime configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Output clock rate of the mixing engine (Hz)
    pub output_sample_rate: u32,

    /// Sound slots (concurrently existing sounds across all groups)
    pub max_sounds: usize,
    /// Data sources fed from the chunk cache
    pub max_streaming_sources: usize,
    /// Data sources fed from resident memory
    pub max_buffer_sources: usize,
    pub max_fade_nodes: usize,
    /// Active group instances (each owns one mix node)
    pub max_active_groups: usize,
    pub max_banks: usize,

    /// Bytes per cache chunk
    pub chunk_size: usize,
    pub chunk_count: usize,
    /// Async reader request ring; must be a power of two
    pub reader_queue_capacity: usize,

    /// Worker threads for decode jobs
    pub decode_workers: usize,
    /// Decoded MP3 output buffers kept ahead of playback
    pub mp3_output_buffers: usize,
    /// MP3 frames per decoded output buffer
    pub mp3_frames_per_buffer: usize,
    /// Block size handed to decoders for resident data
    pub resident_block_size: usize,

    /// Fixed seed for random nodes; entropy-seeded when absent
    pub random_seed: Option<u64>,

    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "cue_rt=info".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 48_000,
            max_sounds: 64,
            max_streaming_sources: 32,
            max_buffer_sources: 64,
            max_fade_nodes: 32,
            max_active_groups: 64,
            max_banks: 8,
            chunk_size: 64 * 1024,
            chunk_count: 64,
            reader_queue_capacity: 64,
            decode_workers: 1,
            mp3_output_buffers: 4,
            mp3_frames_per_buffer: 4,
            resident_block_size: 16 * 1024,
            random_seed: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Resolve and load the config file, falling back to defaults when no
    /// file is found.
    ///
    /// # Arguments
    /// - `cli_path`: explicit path from the command line; an explicit path
    ///   that cannot be read is an error
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let config = match cue_common::config::resolve_config_path(cli_path) {
            Some(path) => {
                info!("Loading config from {}", path.display());
                cue_common::config::load_toml_file::<RuntimeConfig>(&path)?
            }
            None => {
                info!("No config file found, using built-in defaults");
                RuntimeConfig::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RuntimeConfig = cue_common::config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero capacities and a non-power-of-two reader ring
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("output_sample_rate", self.output_sample_rate as usize),
            ("max_sounds", self.max_sounds),
            ("max_streaming_sources", self.max_streaming_sources),
            ("max_buffer_sources", self.max_buffer_sources),
            ("max_fade_nodes", self.max_fade_nodes),
            ("max_active_groups", self.max_active_groups),
            ("max_banks", self.max_banks),
            ("chunk_size", self.chunk_size),
            ("chunk_count", self.chunk_count),
            ("reader_queue_capacity", self.reader_queue_capacity),
            ("decode_workers", self.decode_workers),
            ("mp3_output_buffers", self.mp3_output_buffers),
            ("mp3_frames_per_buffer", self.mp3_frames_per_buffer),
            ("resident_block_size", self.resident_block_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if !self.reader_queue_capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "reader_queue_capacity must be a power of two, got {}",
                self.reader_queue_capacity
            )));
        }

        // PCM blocks are cut on frame boundaries inside a chunk
        if self.chunk_size < 64 || self.resident_block_size < 64 {
            return Err(Error::Config(
                "chunk_size and resident_block_size must be at least 64 bytes".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = RuntimeConfig::from_toml("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = RuntimeConfig::from_toml(
            r#"
            output_sample_rate = 44100
            chunk_count = 8
            random_seed = 7

            [logging]
            level = "cue_rt=debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.output_sample_rate, 44_100);
        assert_eq!(config.chunk_count, 8);
        assert_eq!(config.random_seed, Some(7));
        assert_eq!(config.logging.level, "cue_rt=debug");
        assert_eq!(config.max_sounds, RuntimeConfig::default().max_sounds);
    }

    #[test]
    fn test_ring_capacity_must_be_power_of_two() {
        let err = RuntimeConfig::from_toml("reader_queue_capacity = 48").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(RuntimeConfig::from_toml("reader_queue_capacity = 128").is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(RuntimeConfig::from_toml("max_sounds = 0").is_err());
        assert!(RuntimeConfig::from_toml("chunk_count = 0").is_err());
    }

    #[test]
    fn test_wrong_type_is_error() {
        assert!(RuntimeConfig::from_toml("max_sounds = \"many\"").is_err());
    }
}
