//! AES-256-GCM encrypted credential blob storage.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;
use zeroize::ZeroizeOnDrop;

use crate::auth::AuthSession;

/// Key-value entry holding the encrypted credential blob.
const SESSION_ENTRY: &str = "contentpass.session";
/// Key-value entry holding the initialization vector.
const IV_ENTRY: &str = "contentpass.iv";
/// AES-GCM nonce length in bytes.
const IV_LEN: usize = 12;

/// Error type for encrypted credential storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored blob or IV is corrupt, or was written with a different key.
    #[error("stored credential blob could not be decrypted")]
    Decryption,

    /// The credential could not be encrypted.
    #[error("credential blob could not be encrypted")]
    Encryption,

    /// The decrypted or to-be-encrypted credential is not valid JSON.
    #[error("credential serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// The backing key-value store failed.
    #[error("blob store backend failed: {0}")]
    Backend(String),

    /// The key provider failed to supply the symmetric key.
    #[error("key provider failed: {0}")]
    Key(String),
}

/// Opaque local key-value store for string entries.
///
/// Implementations must tolerate concurrent reads; the SDK is the only
/// writer.
pub trait BlobStore: Send + Sync {
    /// Read an entry, `None` when absent.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backing store fails.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write an entry, replacing any previous value.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backing store fails.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove an entry. Removing an absent entry is not an error.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backing store fails.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Supplies the durable symmetric encryption key.
///
/// The key is acquired once and cached for the process lifetime; providers
/// backed by a hardware key store only see one access per process.
pub trait KeyProvider: Send + Sync {
    /// Return the 32-byte AES-256 key.
    ///
    /// # Errors
    /// Returns [`StoreError::Key`] when the platform key store is
    /// unavailable.
    fn provide_key(&self) -> Result<[u8; 32], StoreError>;
}

#[derive(ZeroizeOnDrop)]
struct CachedKey([u8; 32]);

/// Encrypts, decrypts, and persists one credential blob.
pub struct SecureBlobStore {
    blobs: Box<dyn BlobStore>,
    keys: Box<dyn KeyProvider>,
    cached_key: OnceCell<CachedKey>,
}

impl SecureBlobStore {
    /// Create a store over the given capabilities.
    #[must_use]
    pub fn new(blobs: Box<dyn BlobStore>, keys: Box<dyn KeyProvider>) -> Self {
        Self { blobs, keys, cached_key: OnceCell::new() }
    }

    fn cipher(&self) -> Result<Aes256Gcm, StoreError> {
        let key = self.cached_key.get_or_try_init(|| self.keys.provide_key().map(CachedKey))?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)))
    }

    /// Encrypt and persist a credential, replacing any previous blob.
    ///
    /// A fresh random IV is drawn for every write and stored alongside the
    /// ciphertext.
    ///
    /// # Errors
    /// Returns an error if serialization, encryption, or the backing store
    /// fails.
    pub fn store(&self, session: &AuthSession) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(session)?;
        let cipher = self.cipher()?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| StoreError::Encryption)?;

        self.blobs.set(IV_ENTRY, &BASE64.encode(iv))?;
        self.blobs.set(SESSION_ENTRY, &BASE64.encode(ciphertext))?;

        debug!("credential blob persisted");
        Ok(())
    }

    /// Load and decrypt the persisted credential.
    ///
    /// # Errors
    /// Returns `Ok(None)` when no blob is stored and
    /// [`StoreError::Decryption`] when the blob or IV is corrupt. Callers
    /// treat a decryption failure as "no stored credential".
    pub fn load(&self) -> Result<Option<AuthSession>, StoreError> {
        let Some(blob) = self.blobs.get(SESSION_ENTRY)? else {
            return Ok(None);
        };
        let Some(iv) = self.blobs.get(IV_ENTRY)? else {
            // Ciphertext without its IV cannot be recovered.
            return Err(StoreError::Decryption);
        };

        let iv = BASE64.decode(iv).map_err(|_| StoreError::Decryption)?;
        if iv.len() != IV_LEN {
            return Err(StoreError::Decryption);
        }
        let ciphertext = BASE64.decode(blob).map_err(|_| StoreError::Decryption)?;

        let cipher = self.cipher()?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| StoreError::Decryption)?;

        let session = serde_json::from_slice(&plaintext)?;
        Ok(Some(session))
    }

    /// Remove the persisted blob and IV. Idempotent.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backing store fails.
    pub fn delete(&self) -> Result<(), StoreError> {
        self.blobs.remove(SESSION_ENTRY)?;
        self.blobs.remove(IV_ENTRY)?;
        debug!("credential blob deleted");
        Ok(())
    }
}
