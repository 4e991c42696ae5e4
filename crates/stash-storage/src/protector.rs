use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use stash_core::protect::{DataProtector, ProtectionError};

use crate::key_provider::{KeyMaterial, KeyProvider};

const NONCE_LEN: usize = 12;

/// AES-256-GCM data protection keyed by a [`KeyProvider`].
///
/// The optional entropy is bound as associated data, so content protected with one
/// entropy value cannot be unprotected with another.
pub struct AesGcmProtector<P: KeyProvider> {
    key_provider: P,
    entropy: Vec<u8>,
}

impl<P: KeyProvider> AesGcmProtector<P> {
    pub fn new(key_provider: P) -> Self {
        Self::with_entropy(key_provider, Vec::new())
    }

    pub fn with_entropy(key_provider: P, entropy: impl Into<Vec<u8>>) -> Self {
        Self {
            key_provider,
            entropy: entropy.into(),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, ProtectionError> {
        let material = self
            .key_provider
            .get_or_create()
            .map_err(|e| ProtectionError::Key(e.to_string()))?;
        build_cipher(&material)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlob {
    nonce: String,
    ciphertext: String,
}

impl<P: KeyProvider> DataProtector for AesGcmProtector<P> {
    fn protect(&self, plaintext: &str) -> Result<Vec<u8>, ProtectionError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &self.entropy,
                },
            )
            .map_err(|e| ProtectionError::Protect(format!("encrypt failed: {e}")))?;

        let blob = StoredBlob {
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        serde_json::to_vec(&blob).map_err(|e| ProtectionError::Protect(e.to_string()))
    }

    fn unprotect(&self, protected: &[u8]) -> Result<String, ProtectionError> {
        let blob: StoredBlob = serde_json::from_slice(protected)
            .map_err(|e| ProtectionError::Unprotect(format!("not a protected blob: {e}")))?;

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(blob.nonce)
            .map_err(|e| ProtectionError::Unprotect(format!("nonce decode failed: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(ProtectionError::Unprotect(format!(
                "expected {NONCE_LEN}-byte nonce, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(blob.ciphertext)
            .map_err(|e| ProtectionError::Unprotect(format!("ciphertext decode failed: {e}")))?;

        let cipher = self.cipher()?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &self.entropy,
                },
            )
            .map_err(|e| ProtectionError::Unprotect(format!("decrypt failed: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| ProtectionError::Unprotect(e.to_string()))
    }
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, ProtectionError> {
    Aes256Gcm::new_from_slice(&material.bytes)
        .map_err(|e| ProtectionError::Key(format!("cipher init failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    #[test]
    fn protect_hides_plaintext_and_unprotect_restores_it() {
        let protector = AesGcmProtector::new(InMemoryKeyProvider::default());

        let protected = protector.protect("refresh-token-123").expect("protect");
        let raw = String::from_utf8_lossy(&protected);
        assert!(!raw.contains("refresh-token-123"));

        assert_eq!(
            protector.unprotect(&protected).expect("unprotect"),
            "refresh-token-123"
        );
    }

    #[test]
    fn entropy_must_match() {
        let keys = InMemoryKeyProvider::default();
        let writer = AesGcmProtector::with_entropy(keys.clone(), b"app-a".to_vec());
        let reader = AesGcmProtector::with_entropy(keys, b"app-b".to_vec());

        let protected = writer.protect("secret").expect("protect");
        let err = reader.unprotect(&protected).expect_err("entropy mismatch");
        assert!(matches!(err, ProtectionError::Unprotect(_)));
    }

    #[test]
    fn plaintext_input_is_rejected() {
        let protector = AesGcmProtector::new(InMemoryKeyProvider::default());
        let err = protector
            .unprotect(b"{\"access_token\": \"plain\"}")
            .expect_err("plaintext is not protected");
        assert!(matches!(err, ProtectionError::Unprotect(_)));
    }
}
