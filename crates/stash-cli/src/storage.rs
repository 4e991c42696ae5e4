use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::data_dir;
use stash_core::persistence::Persistence;
use stash_lock::CrossProcessLock;
use stash_storage::{
    file::FilePersistence,
    key_provider::KeyringProvider,
    keyring_persistence::KeyringPersistence,
    protected_file::DataProtectedFilePersistence,
    protector::AesGcmProtector,
};
use tracing::debug;

use crate::config::{Backend, Config};

const SERVICE: &str = "stash";
const CACHE_ACCOUNT: &str = "token-cache";
const KEY_ACCOUNT: &str = "data-protection-key";

/// Resolve the default data directory for stash.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("stash"))
}

/// The cache file (or signal file) configured, else one under the data directory.
pub fn resolve_location(config: &Config) -> Result<PathBuf> {
    if let Some(location) = &config.location {
        return Ok(location.clone());
    }
    let file = match config.backend {
        Backend::Keyring => "cache.signal",
        Backend::File | Backend::Protected => "cache.bin",
    };
    Ok(default_data_dir()?.join(file))
}

/// The lock guarding `location`: configured, else `<location>.lockfile`.
pub fn lock_for(config: &Config, location: &Path) -> CrossProcessLock {
    let path = config.lock_path.clone().unwrap_or_else(|| {
        let mut name = OsString::from(location.as_os_str());
        name.push(".lockfile");
        PathBuf::from(name)
    });
    CrossProcessLock::new(path)
}

/// Build the configured backend.
pub fn backend_from_config(config: &Config) -> Result<Box<dyn Persistence>> {
    let location = resolve_location(config)?;
    debug!(?location, backend = ?config.backend, "initializing persistence");

    let backend: Box<dyn Persistence> = match config.backend {
        Backend::File => Box::new(FilePersistence::new(&location)?),
        Backend::Protected => {
            let entropy = config.entropy.clone().unwrap_or_default();
            let protector = AesGcmProtector::with_entropy(
                KeyringProvider::new(SERVICE, KEY_ACCOUNT),
                entropy.into_bytes(),
            );
            Box::new(DataProtectedFilePersistence::new(&location, protector)?)
        }
        Backend::Keyring => {
            let service = config.service.as_deref().unwrap_or(SERVICE);
            let account = config.account.as_deref().unwrap_or(CACHE_ACCOUNT);
            Box::new(KeyringPersistence::keychain(&location, service, account)?)
        }
    };
    Ok(backend)
}
