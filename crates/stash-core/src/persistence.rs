use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{protect::ProtectionError, secret_store::SecretStoreError};

/// `ENOENT` on every platform stash targets (also `ERROR_FILE_NOT_FOUND` on Windows).
pub const ENOENT: i32 = 2;

const NOT_INITIALIZED: &str =
    "Persistence not initialized. You can recover by calling a save() first.";

/// Errors produced by persistence backends.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Nothing was ever saved for this handle.
    #[error("{message} (code {code}, location: {location})")]
    NotFound {
        code: i32,
        message: String,
        location: String,
    },
    /// Native secret-store failure other than a missing entry.
    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),
    /// Data-protection transform failed.
    #[error(transparent)]
    Protection(#[from] ProtectionError),
    /// Unexpected filesystem failure, passed through untouched.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported platform: {0}")]
    Unsupported(String),
}

impl PersistenceError {
    /// NotFound with the default code and recovery hint.
    pub fn not_found(location: impl Into<String>) -> Self {
        Self::not_found_with(ENOENT, NOT_INITIALIZED, location)
    }

    pub fn not_found_with(
        code: i32,
        message: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
            location: location.into(),
        }
    }

    /// Translate an I/O error: a missing path becomes NotFound, anything else is kept as-is.
    pub fn from_io(err: std::io::Error, location: impl Into<String>) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found_with(
                err.raw_os_error().unwrap_or(ENOENT),
                NOT_INITIALIZED,
                location,
            )
        } else {
            Self::Io(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The capability every backend exposes: whole-blob save/load plus metadata.
///
/// Implementations do not lock; callers pair them with a cross-process lock.
pub trait Persistence: Send + Sync {
    /// Whether content is encrypted at rest. Fixed per backend type.
    fn is_encrypted(&self) -> bool;

    /// Replace the stored content.
    fn save(&self, content: &str) -> Result<(), PersistenceError>;

    /// Load the stored content, or `NotFound` if `save` was never called.
    fn load(&self) -> Result<String, PersistenceError>;

    /// When the content was last saved, or `NotFound` if `save` was never called.
    fn time_last_modified(&self) -> Result<DateTime<Utc>, PersistenceError>;

    /// Where this backend keeps its (meta)data, for diagnostics.
    fn location(&self) -> String;
}

impl<P: Persistence + ?Sized> Persistence for Box<P> {
    fn is_encrypted(&self) -> bool {
        (**self).is_encrypted()
    }

    fn save(&self, content: &str) -> Result<(), PersistenceError> {
        (**self).save(content)
    }

    fn load(&self) -> Result<String, PersistenceError> {
        (**self).load()
    }

    fn time_last_modified(&self) -> Result<DateTime<Utc>, PersistenceError> {
        (**self).time_last_modified()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn missing_path_maps_to_not_found() {
        let err = PersistenceError::from_io(
            io::Error::from_raw_os_error(ENOENT),
            "/tmp/x/cache.bin",
        );
        match err {
            PersistenceError::NotFound { code, location, .. } => {
                assert_eq!(code, ENOENT);
                assert_eq!(location, "/tmp/x/cache.bin");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn other_io_errors_pass_through() {
        let err = PersistenceError::from_io(
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
            "somewhere",
        );
        match err {
            PersistenceError::Io(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::PermissionDenied);
                assert_eq!(inner.to_string(), "nope");
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn not_found_message_mentions_recovery() {
        let err = PersistenceError::not_found("Service:svc Account:acct");
        assert!(err.is_not_found());
        let rendered = err.to_string();
        assert!(rendered.contains("save()"));
        assert!(rendered.contains("Service:svc Account:acct"));
    }
}
