use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use zeroize::Zeroizing;

use super::provider::{validate_id, SecretKind, SecretOrigin, SecretProvider, SecretValue};
use crate::error_handling::types::SecretError;
use crate::recording::{AuditLog, AuditOperation, AuditOutcome};

/// Identifiers starting with this prefix are served by the external vault.
pub const VAULT_PREFIX: &str = "vault:";

/// Read-through view over the local store and the optional external vault.
///
/// The provider is chosen from the identifier namespace only. Every read is
/// recorded as a `decrypt` audit event.
pub struct SecretAggregator {
    local: Arc<dyn SecretProvider>,
    vault: Option<Arc<dyn SecretProvider>>,
    vault_timeout: Duration,
    audit: Arc<AuditLog>,
}

impl SecretAggregator {
    pub fn new(
        local: Arc<dyn SecretProvider>,
        vault: Option<Arc<dyn SecretProvider>>,
        vault_timeout: Duration,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            local,
            vault,
            vault_timeout,
            audit,
        }
    }

    fn route<'a>(&self, id: &'a str) -> Result<(&Arc<dyn SecretProvider>, &'a str), SecretError> {
        match id.strip_prefix(VAULT_PREFIX) {
            Some(rest) => {
                validate_id(rest)?;
                let vault = self.vault.as_ref().ok_or_else(|| {
                    warn!("Vault reference {} used but no vault is configured", id);
                    SecretError::NotFound
                })?;
                Ok((vault, rest))
            }
            None => {
                validate_id(id)?;
                Ok((&self.local, id))
            }
        }
    }

    async fn bounded<T>(
        &self,
        provider: &Arc<dyn SecretProvider>,
        call: impl std::future::Future<Output = Result<T, SecretError>>,
    ) -> Result<T, SecretError> {
        match provider.origin() {
            SecretOrigin::Local => call.await,
            SecretOrigin::Vault => tokio::time::timeout(self.vault_timeout, call)
                .await
                .map_err(|_| SecretError::VaultTimeout)?,
        }
    }

    pub async fn get(&self, kind: SecretKind, id: &str) -> Result<SecretValue, SecretError> {
        let (provider, key) = self.route(id)?;
        let result = self
            .bounded(provider, provider.get_decrypted(kind, key))
            .await
            .map(|bytes| SecretValue::new(provider.origin(), bytes));

        self.audit.record(
            AuditOperation::Decrypt,
            &format!("{}:{}", kind, id),
            AuditOutcome::of(&result),
        );
        if let Ok(value) = &result {
            debug!("Resolved {} secret {} from {:?}", kind, id, value.origin());
        }
        result
    }

    /// Convenience for secrets that must be text (keys, script bodies).
    pub async fn get_text(&self, kind: SecretKind, id: &str) -> Result<Zeroizing<String>, SecretError> {
        let value = self.get(kind, id).await?;
        Ok(Zeroizing::new(value.expose_str()?.to_owned()))
    }

    pub async fn put(&self, kind: SecretKind, id: &str, plaintext: &[u8]) -> Result<(), SecretError> {
        let (provider, key) = self.route(id)?;
        self.bounded(provider, provider.put_encrypted(kind, key, plaintext))
            .await
    }

    pub async fn delete(&self, kind: SecretKind, id: &str) -> Result<(), SecretError> {
        let (provider, key) = self.route(id)?;
        self.bounded(provider, provider.delete(kind, key)).await
    }
}
