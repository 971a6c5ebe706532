//! Secret storage.
//!
//! Credentials, script bodies and variable values are reached through the
//! [`SecretProvider`] contract. [`LocalSecretStore`] keeps them encrypted in
//! SQLite, [`KeyringVault`] reads them from the OS keyring, and
//! [`SecretAggregator`] routes each identifier to one of them by namespace.

pub mod aggregator;
pub mod keyring_vault;
pub mod local_store;
pub mod provider;

pub use aggregator::{SecretAggregator, VAULT_PREFIX};
pub use keyring_vault::KeyringVault;
pub use local_store::LocalSecretStore;
pub use provider::{SecretKind, SecretOrigin, SecretProvider, SecretValue};
