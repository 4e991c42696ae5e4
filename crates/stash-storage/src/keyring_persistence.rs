use std::{collections::BTreeMap, fmt, path::Path};

use chrono::{DateTime, Utc};
use stash_core::{
    persistence::{Persistence, PersistenceError, ENOENT},
    secret_store::{SecretSession, SecretStore, SecretStoreError},
};
use tracing::instrument;

use crate::{file::FilePersistence, keyring_store::KeyringSecretStore};

/// How an entry is addressed in the native secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretIdentity {
    /// Keychain-style generic password.
    Account { service: String, account: String },
    /// Secret-Service-style schema plus lookup attributes.
    Schema {
        schema: String,
        attributes: BTreeMap<String, String>,
    },
}

impl SecretIdentity {
    pub fn account(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self::Account {
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn schema<K, V>(
        schema: impl Into<String>,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::Schema {
            schema: schema.into(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Some native stores block on an interactive prompt when identity is missing,
    /// so incomplete identities are rejected up front.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        match self {
            Self::Account { service, account } => {
                if service.is_empty() || account.is_empty() {
                    return Err(PersistenceError::InvalidConfig(
                        "service and account are required".to_string(),
                    ));
                }
            }
            Self::Schema { schema, attributes } => {
                if schema.is_empty() || attributes.is_empty() {
                    return Err(PersistenceError::InvalidConfig(
                        "schema and attributes are required".to_string(),
                    ));
                }
                if attributes.keys().any(String::is_empty) {
                    return Err(PersistenceError::InvalidConfig(
                        "attribute names must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The `(service, account)` pair handed to the native store.
    fn coordinates(&self) -> (String, String) {
        match self {
            Self::Account { service, account } => (service.clone(), account.clone()),
            Self::Schema { schema, attributes } => (schema.clone(), join_attributes(attributes)),
        }
    }
}

impl fmt::Display for SecretIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account { service, account } => {
                write!(f, "Service:{service} Account:{account}")
            }
            Self::Schema { schema, attributes } => {
                write!(f, "Schema:{schema} Attributes:{}", join_attributes(attributes))
            }
        }
    }
}

/// `k=v,k=v` with backslash, `,` and `=` escaped by a backslash so distinct maps never collide.
fn join_attributes(attributes: &BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(k, v)| format!("{}={}", escape_attribute(k), escape_attribute(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_attribute(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ',' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Content kept in an OS secret store; a signal file carries the modification time.
pub struct KeyringPersistence<S: SecretStore> {
    store: S,
    identity: SecretIdentity,
    signal: FilePersistence,
}

impl<S: SecretStore> KeyringPersistence<S> {
    pub fn new(
        signal_location: impl AsRef<Path>,
        store: S,
        identity: SecretIdentity,
    ) -> Result<Self, PersistenceError> {
        identity.validate()?;
        Ok(Self {
            store,
            identity,
            signal: FilePersistence::new(signal_location)?,
        })
    }

    pub fn identity(&self) -> &SecretIdentity {
        &self.identity
    }

    pub fn signal(&self) -> &FilePersistence {
        &self.signal
    }

    fn translate(&self, err: SecretStoreError) -> PersistenceError {
        if err.is_not_found() {
            PersistenceError::not_found_with(
                ENOENT,
                "Keyring persistence not initialized. You can recover by calling a save() first.",
                self.identity.to_string(),
            )
        } else {
            PersistenceError::SecretStore(err)
        }
    }
}

impl KeyringPersistence<KeyringSecretStore> {
    /// Generic password in the default OS store, addressed by service and account.
    pub fn keychain(
        signal_location: impl AsRef<Path>,
        service: impl Into<String>,
        account: impl Into<String>,
    ) -> Result<Self, PersistenceError> {
        let identity = SecretIdentity::account(service, account);
        identity.validate()?;
        Self::new(signal_location, KeyringSecretStore::new()?, identity)
    }

    /// Entry in the default OS store addressed by schema and attributes.
    pub fn secret_service(
        signal_location: impl AsRef<Path>,
        schema: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Result<Self, PersistenceError> {
        let identity = SecretIdentity::schema(schema, attributes);
        identity.validate()?;
        Self::new(signal_location, KeyringSecretStore::new()?, identity)
    }
}

impl<S: SecretStore> Persistence for KeyringPersistence<S> {
    fn is_encrypted(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(identity = %self.identity))]
    fn save(&self, content: &str) -> Result<(), PersistenceError> {
        let (service, account) = self.identity.coordinates();
        {
            let session = self.store.open().map_err(|e| self.translate(e))?;
            session
                .set(&service, &account, content)
                .map_err(|e| self.translate(e))?;
        }
        self.signal.touch()
    }

    #[instrument(skip_all, fields(identity = %self.identity))]
    fn load(&self) -> Result<String, PersistenceError> {
        let (service, account) = self.identity.coordinates();
        let session = self.store.open().map_err(|e| self.translate(e))?;
        session
            .find(&service, &account)
            .map_err(|e| self.translate(e))
    }

    fn time_last_modified(&self) -> Result<DateTime<Utc>, PersistenceError> {
        self.signal.time_last_modified()
    }

    fn location(&self) -> String {
        self.signal.location()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use stash_core::secret_store::InMemorySecretStore;

    use super::*;

    #[test]
    fn round_trip_touches_signal_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = dir.path().join("cache.signal");
        let store = InMemorySecretStore::new();
        let persistence = KeyringPersistence::new(
            &signal,
            store.clone(),
            SecretIdentity::account("stash", "token-cache"),
        )
        .expect("new");
        assert!(persistence.is_encrypted());

        persistence.save("cached tokens").expect("save");
        assert_eq!(persistence.load().expect("load"), "cached tokens");

        persistence.save("rotated").expect("overwrite");
        assert_eq!(persistence.load().expect("load"), "rotated");

        assert_eq!(fs::read_to_string(&signal).expect("signal"), "");
        persistence.time_last_modified().expect("mtime from signal");
        assert_eq!(persistence.location(), signal.display().to_string());
        assert_eq!(store.sessions_live(), 0, "sessions must be released");
    }

    #[test]
    fn never_saved_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = KeyringPersistence::new(
            dir.path().join("cache.signal"),
            InMemorySecretStore::new(),
            SecretIdentity::account("svc", "acct"),
        )
        .expect("new");

        match persistence.load().expect_err("nothing saved yet") {
            PersistenceError::NotFound { code, location, .. } => {
                assert_eq!(code, ENOENT);
                assert_eq!(location, "Service:svc Account:acct");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(persistence
            .time_last_modified()
            .expect_err("no signal yet")
            .is_not_found());
    }

    #[test]
    fn empty_identity_fails_before_touching_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signal = dir.path().join("cache.signal");
        let store = InMemorySecretStore::new();

        for identity in [
            SecretIdentity::account("", "acct"),
            SecretIdentity::account("svc", ""),
            SecretIdentity::schema("", [("k", "v")]),
            SecretIdentity::schema("schema", Vec::<(String, String)>::new()),
            SecretIdentity::schema("schema", [("", "v")]),
        ] {
            let err = KeyringPersistence::new(&signal, store.clone(), identity)
                .err()
                .expect("should reject");
            assert!(matches!(err, PersistenceError::InvalidConfig(_)));
        }

        let err = KeyringPersistence::keychain(&signal, "", "")
            .err()
            .expect("should reject");
        assert!(matches!(err, PersistenceError::InvalidConfig(_)));

        assert_eq!(store.sessions_opened(), 0);
        assert!(!signal.exists());
    }

    #[test]
    fn schema_identity_round_trips_and_describes_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = SecretIdentity::schema(
            "org.example.TokenCache",
            [("env", "prod"), ("app", "stash")],
        );
        assert_eq!(
            identity.to_string(),
            "Schema:org.example.TokenCache Attributes:app=stash,env=prod"
        );

        let persistence = KeyringPersistence::new(
            dir.path().join("cache.signal"),
            InMemorySecretStore::new(),
            identity.clone(),
        )
        .expect("new");
        let err = persistence.load().expect_err("nothing saved yet");
        assert!(err.to_string().contains(&identity.to_string()));

        persistence.save("blob").expect("save");
        assert_eq!(persistence.load().expect("load"), "blob");
    }

    #[test]
    fn attribute_separators_do_not_alias_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = InMemorySecretStore::new();
        let packed = KeyringPersistence::new(
            dir.path().join("packed.signal"),
            store.clone(),
            SecretIdentity::schema("s", [("a", "1,b=2")]),
        )
        .expect("new");
        let split = KeyringPersistence::new(
            dir.path().join("split.signal"),
            store.clone(),
            SecretIdentity::schema("s", [("a", "1"), ("b", "2")]),
        )
        .expect("new");
        assert_ne!(packed.identity().to_string(), split.identity().to_string());

        packed.save("secret-of-packed").expect("save");
        assert!(split.load().expect_err("never saved").is_not_found());
        assert_eq!(packed.load().expect("load"), "secret-of-packed");
    }

    #[test]
    fn other_store_failures_propagate_with_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = InMemorySecretStore::new();
        let persistence = KeyringPersistence::new(
            dir.path().join("cache.signal"),
            store.clone(),
            SecretIdentity::account("svc", "acct"),
        )
        .expect("new");

        store.set_failure(Some(SecretStoreError::new(
            SecretStoreError::ACCESS_DENIED,
            "user denied access",
        )));

        let err = persistence.save("x").expect_err("store refuses");
        match err {
            PersistenceError::SecretStore(inner) => {
                assert_eq!(inner.code, SecretStoreError::ACCESS_DENIED)
            }
            other => panic!("expected SecretStore, got {other:?}"),
        }
        assert!(
            persistence.signal().time_last_modified().is_err(),
            "signal must not be touched on failure"
        );

        let err = persistence.load().expect_err("store refuses");
        assert!(matches!(err, PersistenceError::SecretStore(_)));
        assert_eq!(store.sessions_live(), 0);
    }
}
