use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use thiserror::Error;
use tracing::debug;

/// Failure reported by a native secret store, with its numeric status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("secret store error {code}: {message}")]
pub struct SecretStoreError {
    pub code: i32,
    pub message: String,
}

/// Programmatic classification of the status codes callers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStoreErrorKind {
    AccessDenied,
    NoSuchStore,
    NoDefaultStore,
    ItemNotFound,
    Other,
}

impl SecretStoreError {
    pub const ACCESS_DENIED: i32 = -128;
    pub const NO_SUCH_KEYCHAIN: i32 = -25294;
    pub const NO_DEFAULT: i32 = -25307;
    pub const ITEM_NOT_FOUND: i32 = -25300;
    /// The backend reported a failure without a native status code.
    pub const UNCLASSIFIED: i32 = -1;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn item_not_found(message: impl Into<String>) -> Self {
        Self::new(Self::ITEM_NOT_FOUND, message)
    }

    pub fn kind(&self) -> SecretStoreErrorKind {
        match self.code {
            Self::ACCESS_DENIED => SecretStoreErrorKind::AccessDenied,
            Self::NO_SUCH_KEYCHAIN => SecretStoreErrorKind::NoSuchStore,
            Self::NO_DEFAULT => SecretStoreErrorKind::NoDefaultStore,
            Self::ITEM_NOT_FOUND => SecretStoreErrorKind::ItemNotFound,
            _ => SecretStoreErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == SecretStoreErrorKind::ItemNotFound
    }
}

/// A platform secret store. `open` yields a session that is released on drop.
pub trait SecretStore: Send + Sync {
    type Session: SecretSession;

    fn open(&self) -> Result<Self::Session, SecretStoreError>;
}

/// Generic-password operations on an open store handle.
pub trait SecretSession {
    /// Fetch the secret, or an `ITEM_NOT_FOUND` error.
    fn find(&self, service: &str, account: &str) -> Result<String, SecretStoreError>;

    fn add(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError>;

    fn modify(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError>;

    /// Modify the entry if it exists, add it if it does not.
    fn set(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        match self.find(service, account) {
            Ok(_) => self.modify(service, account, value),
            Err(err) if err.is_not_found() => {
                debug!(service, account, "secret entry missing, adding");
                self.add(service, account, value)
            }
            Err(err) => Err(err),
        }
    }
}

type Entries = HashMap<(String, String), String>;

/// In-memory secret store for tests and smoke runs. Not protected in any way.
///
/// Counts opened and currently-live sessions so callers can observe interaction.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecretStore {
    entries: Arc<Mutex<Entries>>,
    failure: Arc<Mutex<Option<SecretStoreError>>>,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent session operation fail with `err` (or succeed again with `None`).
    pub fn set_failure(&self, err: Option<SecretStoreError>) {
        if let Ok(mut guard) = self.failure.lock() {
            *guard = err;
        }
    }

    /// Total sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sessions opened but not yet released.
    pub fn sessions_live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl SecretStore for InMemorySecretStore {
    type Session = InMemorySession;

    fn open(&self) -> Result<Self::Session, SecretStoreError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(InMemorySession {
            entries: Arc::clone(&self.entries),
            failure: Arc::clone(&self.failure),
            live: Arc::clone(&self.live),
        })
    }
}

#[derive(Debug)]
pub struct InMemorySession {
    entries: Arc<Mutex<Entries>>,
    failure: Arc<Mutex<Option<SecretStoreError>>>,
    live: Arc<AtomicUsize>,
}

impl InMemorySession {
    fn entries(&self) -> Result<MutexGuard<'_, Entries>, SecretStoreError> {
        let injected = self
            .failure
            .lock()
            .map_err(|err| poisoned(&err))?
            .clone();
        if let Some(err) = injected {
            return Err(err);
        }
        self.entries.lock().map_err(|err| poisoned(&err))
    }
}

impl SecretSession for InMemorySession {
    fn find(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        self.entries()?
            .get(&(service.to_string(), account.to_string()))
            .cloned()
            .ok_or_else(|| {
                SecretStoreError::item_not_found(format!(
                    "no entry for service {service}, account {account}"
                ))
            })
    }

    fn add(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries()?;
        let key = (service.to_string(), account.to_string());
        if entries.contains_key(&key) {
            return Err(SecretStoreError::new(
                SecretStoreError::UNCLASSIFIED,
                "duplicate item",
            ));
        }
        entries.insert(key, value.to_string());
        Ok(())
    }

    fn modify(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries()?;
        match entries.get_mut(&(service.to_string(), account.to_string())) {
            Some(existing) => {
                *existing = value.to_string();
                Ok(())
            }
            None => Err(SecretStoreError::item_not_found("cannot modify missing item")),
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn poisoned<E: std::fmt::Display>(err: &E) -> SecretStoreError {
    SecretStoreError::new(
        SecretStoreError::UNCLASSIFIED,
        format!("lock poisoned: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_codes_classify() {
        assert_eq!(
            SecretStoreError::new(-128, "x").kind(),
            SecretStoreErrorKind::AccessDenied
        );
        assert_eq!(
            SecretStoreError::new(-25294, "x").kind(),
            SecretStoreErrorKind::NoSuchStore
        );
        assert_eq!(
            SecretStoreError::new(-25307, "x").kind(),
            SecretStoreErrorKind::NoDefaultStore
        );
        assert!(SecretStoreError::new(-25300, "x").is_not_found());
        assert_eq!(
            SecretStoreError::new(-25299, "duplicate").kind(),
            SecretStoreErrorKind::Other
        );
    }

    #[test]
    fn set_adds_then_modifies() {
        let store = InMemorySecretStore::new();
        let session = store.open().expect("open");

        let err = session.find("svc", "acct").expect_err("should be missing");
        assert!(err.is_not_found());

        session.set("svc", "acct", "first").expect("add");
        session.set("svc", "acct", "second").expect("modify");
        assert_eq!(session.find("svc", "acct").expect("find"), "second");
    }

    #[test]
    fn sessions_are_released_on_drop() {
        let store = InMemorySecretStore::new();
        {
            let _a = store.open().expect("open a");
            let _b = store.open().expect("open b");
            assert_eq!(store.sessions_live(), 2);
        }
        assert_eq!(store.sessions_live(), 0);
        assert_eq!(store.sessions_opened(), 2);
    }

    #[test]
    fn injected_failure_surfaces_from_set() {
        let store = InMemorySecretStore::new();
        store.set_failure(Some(SecretStoreError::new(
            SecretStoreError::ACCESS_DENIED,
            "denied",
        )));
        let session = store.open().expect("open");
        let err = session.set("svc", "acct", "v").expect_err("should fail");
        assert_eq!(err.kind(), SecretStoreErrorKind::AccessDenied);
    }
}
