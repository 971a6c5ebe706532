use async_trait::async_trait;
use log::debug;
use zeroize::Zeroizing;

use super::provider::{SecretKind, SecretOrigin, SecretProvider};
use crate::error_handling::types::SecretError;

/// External vault backed by the OS keyring.
///
/// Every keyring call blocks, so each one runs on the blocking pool. The
/// aggregator bounds it with the configured vault timeout.
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn user(kind: SecretKind, id: &str) -> String {
        format!("{}/{}", kind.as_str(), id)
    }

    fn entry(&self, kind: SecretKind, id: &str) -> Result<keyring::Entry, SecretError> {
        keyring::Entry::new(&self.service, &Self::user(kind, id))
            .map_err(|e| SecretError::Vault(e.to_string()))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SecretError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SecretError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SecretError::Vault(e.to_string()))?
}

#[async_trait]
impl SecretProvider for KeyringVault {
    fn origin(&self) -> SecretOrigin {
        SecretOrigin::Vault
    }

    async fn get_decrypted(
        &self,
        kind: SecretKind,
        id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let entry = self.entry(kind, id)?;
        blocking(move || match entry.get_secret() {
            Ok(bytes) => Ok(Zeroizing::new(bytes)),
            Err(keyring::Error::NoEntry) => Err(SecretError::NotFound),
            Err(e) => Err(SecretError::Vault(e.to_string())),
        })
        .await
    }

    async fn put_encrypted(
        &self,
        kind: SecretKind,
        id: &str,
        plaintext: &[u8],
    ) -> Result<(), SecretError> {
        let entry = self.entry(kind, id)?;
        let secret = Zeroizing::new(plaintext.to_vec());
        blocking(move || {
            entry
                .set_secret(&secret)
                .map_err(|e| SecretError::Vault(e.to_string()))
        })
        .await?;
        debug!("Stored {} secret {} in keyring", kind, id);
        Ok(())
    }

    async fn delete(&self, kind: SecretKind, id: &str) -> Result<(), SecretError> {
        let entry = self.entry(kind, id)?;
        blocking(move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Vault(e.to_string())),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_user_is_namespaced_by_kind() {
        assert_eq!(KeyringVault::user(SecretKind::Credential, "ops"), "credential/ops");
        assert_eq!(KeyringVault::user(SecretKind::Variable, "TOKEN"), "variable/TOKEN");
        assert_eq!(KeyringVault::new("shellward").origin(), SecretOrigin::Vault);
    }
}
