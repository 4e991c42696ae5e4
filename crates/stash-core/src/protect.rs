use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtectionError {
    #[error("key provider error: {0}")]
    Key(String),
    #[error("protect failed: {0}")]
    Protect(String),
    #[error("unprotect failed: {0}")]
    Unprotect(String),
}

/// Reversible encryption bound to the current user's identity.
///
/// `protect` output is opaque to callers; only the same protector (same user key,
/// same entropy) can `unprotect` it.
pub trait DataProtector: Send + Sync {
    fn protect(&self, plaintext: &str) -> Result<Vec<u8>, ProtectionError>;

    fn unprotect(&self, protected: &[u8]) -> Result<String, ProtectionError>;
}
