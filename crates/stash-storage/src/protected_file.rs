use std::{
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use stash_core::{
    persistence::{Persistence, PersistenceError},
    protect::DataProtector,
};
use tempfile::NamedTempFile;
use tracing::{error, instrument};

use crate::file::FilePersistence;

/// File persistence whose content goes through a [`DataProtector`] before hitting disk.
pub struct DataProtectedFilePersistence<D: DataProtector> {
    file: FilePersistence,
    protector: D,
}

impl<D: DataProtector> DataProtectedFilePersistence<D> {
    pub fn new(location: impl AsRef<Path>, protector: D) -> Result<Self, PersistenceError> {
        Ok(Self {
            file: FilePersistence::new(location)?,
            protector,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl<D: DataProtector> Persistence for DataProtectedFilePersistence<D> {
    fn is_encrypted(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(location = %self.file.path().display()))]
    fn save(&self, content: &str) -> Result<(), PersistenceError> {
        let data = self.protector.protect(content)?;
        self.file.ensure_parent()?;
        write_atomic(self.file.path(), &data)
    }

    #[instrument(skip_all, fields(location = %self.file.path().display()))]
    fn load(&self) -> Result<String, PersistenceError> {
        let data = self.file.read_bytes()?;
        self.protector.unprotect(&data).map_err(|err| {
            error!(
                %err,
                "data protection error, likely caused by file content not previously \
                 protected; migrate by calling save(plaintext) first"
            );
            PersistenceError::from(err)
        })
    }

    fn time_last_modified(&self) -> Result<DateTime<Utc>, PersistenceError> {
        self.file.time_last_modified()
    }

    fn location(&self) -> String {
        self.file.location()
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| PersistenceError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use stash_core::{persistence::ENOENT, protect::ProtectionError};

    use super::*;
    use crate::{key_provider::InMemoryKeyProvider, protector::AesGcmProtector};

    fn protected(
        path: &Path,
    ) -> DataProtectedFilePersistence<AesGcmProtector<InMemoryKeyProvider>> {
        DataProtectedFilePersistence::new(
            path,
            AesGcmProtector::new(InMemoryKeyProvider::default()),
        )
        .expect("new")
    }

    #[test]
    fn round_trip_does_not_store_plaintext() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("cache.bin");
        let persistence = protected(&path);
        assert!(persistence.is_encrypted());

        let content = r#"{"AccessToken": {"secret": "hello-stash"}}"#;
        persistence.save(content).expect("save");

        let stored = fs::read(&path).expect("read ciphertext");
        assert!(
            !String::from_utf8_lossy(&stored).contains("hello-stash"),
            "plaintext must not be stored"
        );
        assert_eq!(persistence.load().expect("load"), content);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = protected(&dir.path().join("cache.bin"));

        match persistence.load().expect_err("nothing saved yet") {
            PersistenceError::NotFound { code, .. } => assert_eq!(code, ENOENT),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(persistence.time_last_modified().unwrap_err().is_not_found());
    }

    #[test]
    fn unprotected_content_is_a_distinct_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.bin");
        fs::write(&path, "plaintext left by an older version").expect("seed");

        let persistence = protected(&path);
        let err = persistence.load().expect_err("plaintext cannot be unprotected");
        assert!(
            matches!(err, PersistenceError::Protection(ProtectionError::Unprotect(_))),
            "got {err:?}"
        );

        persistence.save("migrated").expect("re-save");
        assert_eq!(persistence.load().expect("load"), "migrated");
    }

    #[test]
    fn location_is_the_file_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.bin");
        let persistence = protected(&path);
        assert_eq!(persistence.location(), path.display().to_string());
        assert_eq!(persistence.path(), path.as_path());
    }
}
