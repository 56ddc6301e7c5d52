//! Configuration file resolution and TOML loading
//!
//! Resolution priority:
//! 1. Explicit path (command-line argument)
//! 2. `CUE_CONFIG` environment variable
//! 3. Platform config directory (`<config_dir>/cue/config.toml`)
//! 4. None (caller falls back to built-in defaults)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "CUE_CONFIG";

/// Resolve which config file should be loaded, if any.
///
/// An explicit path is returned even if it does not exist so that the
/// caller reports the error; the environment and platform locations are only
/// returned when the file is present.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!("{} points at missing file {}, ignoring", CONFIG_ENV_VAR, path.display());
    }

    let platform = default_config_path()?;
    if platform.exists() {
        Some(platform)
    } else {
        debug!("No config file at {}", platform.display());
        None
    }
}

/// Platform config file location (`~/.config/cue/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cue").join("config.toml"))
}

/// Parse a TOML document into `T`
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
}

/// Read and parse a TOML file into `T`
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    parse_toml(&content)
}
