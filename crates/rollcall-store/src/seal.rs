//! Embedding encryption at rest (AES-256-GCM).
//!
//! Sealed blob layout: `nonce (12 bytes) || ciphertext+tag`. The plaintext is
//! the little-endian f32 encoding of the embedding values.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rollcall_core::Embedding;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {0} is empty")]
    EmptyKey(String),
    #[error("embedding encryption failed")]
    Encrypt,
    #[error("sealed embedding is corrupt or was sealed with another key")]
    Decrypt,
    #[error("sealed embedding has invalid length {0}")]
    Truncated(usize),
}

/// 256-bit key protecting stored embeddings.
#[derive(Clone)]
pub struct SealKey([u8; KEY_LEN]);

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealKey(..)")
    }
}

impl SealKey {
    /// Derive a key from arbitrary secret bytes with SHA-256.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self(Sha256::digest(secret).into())
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Read the key file at `path`, creating it (mode 0600) with a random key
    /// if it does not exist.
    ///
    /// A 32-byte file is used as the raw key; any other length is treated as
    /// a secret and hashed.
    pub fn load_or_create(path: &Path) -> Result<Self, SealError> {
        let key_err = |source| SealError::KeyFile {
            path: path.display().to_string(),
            source,
        };

        match std::fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Err(SealError::EmptyKey(path.display().to_string())),
            Ok(bytes) => Ok(match <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                Ok(raw) => Self(raw),
                Err(_) => Self::from_secret(&bytes),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(key_err)?;
                }
                let key = Self::generate();
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)
                    .map_err(key_err)?;
                file.write_all(&key.0).map_err(key_err)?;
                tracing::info!(path = %path.display(), "generated new embedding key");
                Ok(key)
            }
            Err(e) => Err(key_err(e)),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypt an embedding's values under a fresh random nonce.
    pub fn seal(&self, embedding: &Embedding) -> Result<Vec<u8>, SealError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, embedding.to_le_bytes().as_slice())
            .map_err(|_| SealError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`seal`](Self::seal).
    pub fn unseal(&self, blob: &[u8], model_version: Option<String>) -> Result<Embedding, SealError> {
        if blob.len() <= NONCE_LEN {
            return Err(SealError::Truncated(blob.len()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;
        Embedding::from_le_bytes(&plaintext, model_version).ok_or(SealError::Truncated(plaintext.len()))
    }
}
