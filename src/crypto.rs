//! Envelope encryption for every secret the service stores.
//!
//! One process-wide data key is loaded at startup (`key_loader`) and wrapped in
//! an [`EncryptionService`] that is shared read-only through the application
//! context. All persisted secrets, script bodies and history transcripts go
//! through it as [`EncryptedBlob`]s.

pub mod encryption_service;
pub mod key_loader;
pub mod types;

pub use encryption_service::EncryptionService;
pub use key_loader::{load_data_key, KeySource};
pub use types::{DataKey, EncryptedBlob};
