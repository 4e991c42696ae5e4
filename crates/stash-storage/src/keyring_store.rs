use stash_core::{
    persistence::PersistenceError,
    secret_store::{SecretSession, SecretStore, SecretStoreError},
};
use tracing::debug;

/// OS secret store (Keychain, Credential Manager, Secret Service) via the `keyring` crate.
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    target: Option<String>,
}

impl KeyringSecretStore {
    /// Use the platform's default store. Fails on targets without a native backend.
    pub fn new() -> Result<Self, PersistenceError> {
        probe_platform()?;
        Ok(Self { target: None })
    }

    /// Use a named store (a keychain domain on macOS, a target name elsewhere).
    pub fn with_target(target: impl Into<String>) -> Result<Self, PersistenceError> {
        probe_platform()?;
        Ok(Self {
            target: Some(target.into()),
        })
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

impl SecretStore for KeyringSecretStore {
    type Session = KeyringSession;

    fn open(&self) -> Result<Self::Session, SecretStoreError> {
        debug!(target_store = ?self.target, "opening keyring session");
        Ok(KeyringSession {
            target: self.target.clone(),
        })
    }
}

/// Session over the OS keyring. Entries are resolved per call; nothing to release.
#[derive(Debug)]
pub struct KeyringSession {
    target: Option<String>,
}

impl KeyringSession {
    fn entry(&self, service: &str, account: &str) -> Result<keyring::Entry, SecretStoreError> {
        let entry = match &self.target {
            Some(target) => keyring::Entry::new_with_target(target, service, account),
            None => keyring::Entry::new(service, account),
        };
        entry.map_err(|err| map_keyring_error(err, self.target.is_some()))
    }
}

impl SecretSession for KeyringSession {
    fn find(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        self.entry(service, account)?
            .get_password()
            .map_err(|err| map_keyring_error(err, self.target.is_some()))
    }

    fn add(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        self.entry(service, account)?
            .set_password(value)
            .map_err(|err| map_keyring_error(err, self.target.is_some()))
    }

    fn modify(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        self.entry(service, account)?
            .set_password(value)
            .map_err(|err| map_keyring_error(err, self.target.is_some()))
    }
}

fn probe_platform() -> Result<(), PersistenceError> {
    if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "windows",
        target_os = "linux"
    )) {
        Ok(())
    } else {
        Err(PersistenceError::Unsupported(format!(
            "no native secret store on {}",
            std::env::consts::OS
        )))
    }
}

fn map_keyring_error(err: keyring::Error, named_store: bool) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::item_not_found(err.to_string()),
        keyring::Error::NoStorageAccess(inner) => {
            let code = if named_store {
                SecretStoreError::NO_SUCH_KEYCHAIN
            } else {
                SecretStoreError::NO_DEFAULT
            };
            SecretStoreError::new(code, inner.to_string())
        }
        other => SecretStoreError::new(SecretStoreError::UNCLASSIFIED, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use stash_core::secret_store::SecretStoreErrorKind;

    use super::*;

    #[test]
    fn no_entry_maps_to_item_not_found() {
        let err = map_keyring_error(keyring::Error::NoEntry, false);
        assert!(err.is_not_found());
    }

    #[test]
    fn missing_store_depends_on_target() {
        let access = || {
            keyring::Error::NoStorageAccess(Box::new(io::Error::other("locked")))
        };
        assert_eq!(
            map_keyring_error(access(), false).kind(),
            SecretStoreErrorKind::NoDefaultStore
        );
        assert_eq!(
            map_keyring_error(access(), true).kind(),
            SecretStoreErrorKind::NoSuchStore
        );
    }

    #[test]
    fn other_failures_are_unclassified() {
        let err = map_keyring_error(
            keyring::Error::Invalid("service".into(), "empty".into()),
            false,
        );
        assert_eq!(err.code, SecretStoreError::UNCLASSIFIED);
        assert_eq!(err.kind(), SecretStoreErrorKind::Other);
    }

    #[test]
    fn supported_platforms_construct() {
        let store = KeyringSecretStore::with_target("User").expect("supported platform");
        assert_eq!(store.target(), Some("User"));
    }
}
