//! Encrypted credential persistence.
//!
//! The credential blob is encrypted at rest with AES-256-GCM. Two capability
//! traits keep the module free of platform assumptions:
//!
//! - [`BlobStore`]: an opaque local key-value store (shared preferences, a
//!   plist, a file — the host decides).
//! - [`KeyProvider`]: supplies the durable 32-byte symmetric key, typically
//!   backed by a hardware-protected platform key store.

mod blob_store;

pub use blob_store::{BlobStore, KeyProvider, SecureBlobStore, StoreError};
