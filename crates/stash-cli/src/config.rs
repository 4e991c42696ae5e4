use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Which persistence backend holds the cache.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Plain-text file.
    #[default]
    File,
    /// File protected with a key held in the OS keyring.
    Protected,
    /// Content stored in the OS keyring itself.
    Keyring,
}

/// User-level configuration loaded from `~/.config/stash/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    /// Cache file (or signal file for the keyring backend).
    pub location: Option<PathBuf>,
    /// Lock file; defaults to `<location>.lockfile`.
    pub lock_path: Option<PathBuf>,
    /// Keyring service for the keyring backend.
    pub service: Option<String>,
    /// Keyring account for the keyring backend.
    pub account: Option<String>,
    /// Entropy bound into the protected backend.
    pub entropy: Option<String>,
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("stash").join("config.toml"))
}

/// Write the given config to `path` (default path when `None`) unless a file already
/// exists, to avoid clobbering user edits.
pub fn write_default_if_missing(config: &Config, path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_path()?,
    };
    write_if_missing(config, &path)?;
    Ok(path)
}

fn write_if_missing(config: &Config, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(())
}
