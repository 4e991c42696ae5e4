use std::{
    ffi::OsStr,
    fs::{self, OpenOptions},
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use stash_core::persistence::{Persistence, PersistenceError};
use tracing::instrument;

/// Plain-text file persistence. Content is stored unencrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePersistence {
    location: PathBuf,
}

impl FilePersistence {
    /// A leading `~` in `location` is expanded to the user's home directory.
    pub fn new(location: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let location = location.as_ref();
        if location.as_os_str().is_empty() {
            return Err(PersistenceError::InvalidConfig(
                "requires a file path".to_string(),
            ));
        }
        Ok(Self {
            location: expand_home(location),
        })
    }

    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Bump the modification time without touching content, creating an empty file if needed.
    #[instrument(skip_all, fields(location = %self.location.display()))]
    pub fn touch(&self) -> Result<(), PersistenceError> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.location)?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    pub(crate) fn ensure_parent(&self) -> Result<(), PersistenceError> {
        if let Some(parent) = self.location.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub(crate) fn read_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        fs::read(&self.location).map_err(|err| PersistenceError::from_io(err, self.location()))
    }
}

impl Persistence for FilePersistence {
    fn is_encrypted(&self) -> bool {
        false
    }

    #[instrument(skip_all, fields(location = %self.location.display()))]
    fn save(&self, content: &str) -> Result<(), PersistenceError> {
        self.ensure_parent()?;
        fs::write(&self.location, content)?;
        Ok(())
    }

    #[instrument(skip_all, fields(location = %self.location.display()))]
    fn load(&self) -> Result<String, PersistenceError> {
        fs::read_to_string(&self.location)
            .map_err(|err| PersistenceError::from_io(err, self.location()))
    }

    fn time_last_modified(&self) -> Result<DateTime<Utc>, PersistenceError> {
        fs::metadata(&self.location)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .map_err(|err| PersistenceError::from_io(err, self.location()))
    }

    fn location(&self) -> String {
        self.location.display().to_string()
    }
}

pub(crate) fn expand_home(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == OsStr::new("~") => match dirs::home_dir() {
            Some(home) => home.join(components.as_path()),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}
