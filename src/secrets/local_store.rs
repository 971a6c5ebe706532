use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use zeroize::Zeroizing;

use super::provider::{SecretKind, SecretOrigin, SecretProvider};
use crate::crypto::{EncryptedBlob, EncryptionService};
use crate::error_handling::types::{SecretError, StorageError};
use crate::storage::db_entities::secrets;

/// Secrets encrypted under the data key and stored in the `secrets` table.
///
/// The associated data of every blob is `secret/<kind>/<id>`, so a blob copied
/// to another row no longer decrypts.
pub struct LocalSecretStore {
    db: DatabaseConnection,
    crypto: Arc<EncryptionService>,
}

fn aad(kind: SecretKind, id: &str) -> Vec<u8> {
    format!("secret/{}/{}", kind.as_str(), id).into_bytes()
}

impl LocalSecretStore {
    pub fn new(db: DatabaseConnection, crypto: Arc<EncryptionService>) -> Self {
        Self { db, crypto }
    }
}

#[async_trait]
impl SecretProvider for LocalSecretStore {
    fn origin(&self) -> SecretOrigin {
        SecretOrigin::Local
    }

    async fn get_decrypted(
        &self,
        kind: SecretKind,
        id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let row = secrets::Entity::find_by_id((kind.as_str().to_string(), id.to_string()))
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?
            .ok_or(SecretError::NotFound)?;
        let blob = EncryptedBlob::decode(&row.blob)?;
        Ok(self.crypto.decrypt(&blob, &aad(kind, id))?)
    }

    async fn put_encrypted(
        &self,
        kind: SecretKind,
        id: &str,
        plaintext: &[u8],
    ) -> Result<(), SecretError> {
        let blob = self.crypto.encrypt(plaintext, &aad(kind, id))?;
        let model = secrets::ActiveModel {
            kind: Set(kind.as_str().to_string()),
            id: Set(id.to_string()),
            blob: Set(blob.encode()),
            updated_at: Set(Utc::now().to_rfc3339()),
        };
        secrets::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([secrets::Column::Kind, secrets::Column::Id])
                    .update_columns([secrets::Column::Blob, secrets::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        debug!("Stored {} secret {}", kind, id);
        Ok(())
    }

    async fn delete(&self, kind: SecretKind, id: &str) -> Result<(), SecretError> {
        secrets::Entity::delete_by_id((kind.as_str().to_string(), id.to_string()))
            .exec(&self.db)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }
}
