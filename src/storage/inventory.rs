//! Read side of the server and credential records.
//!
//! Records are managed by the CRUD layer; the execution core only resolves
//! them by id. `save_*` exist for that layer and for tests.

use async_trait::async_trait;
use log::debug;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};

use crate::error_handling::types::StorageError;
use crate::storage::db_entities::{credentials, servers};
use crate::storage::types::{Credential, Target};

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn get_target(&self, id: &str) -> Result<Target, StorageError>;

    async fn get_credential(&self, id: &str) -> Result<Credential, StorageError>;
}

pub struct SqliteInventory {
    db: DatabaseConnection,
}

impl SqliteInventory {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn save_target(&self, target: &Target) -> Result<(), StorageError> {
        let model = servers::ActiveModel {
            id: Set(target.id.clone()),
            name: Set(target.name.clone()),
            hostname: Set(target.hostname.clone()),
            port: Set(i32::from(target.port)),
            username: Set(target.username.clone()),
            group_name: Set(target.group.clone()),
        };
        servers::Entity::insert(model)
            .on_conflict(
                OnConflict::column(servers::Column::Id)
                    .update_columns([
                        servers::Column::Name,
                        servers::Column::Hostname,
                        servers::Column::Port,
                        servers::Column::Username,
                        servers::Column::GroupName,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        debug!("Saved target {}", target.id);
        Ok(())
    }

    pub async fn save_credential(&self, credential: &Credential) -> Result<(), StorageError> {
        let model = credentials::ActiveModel {
            id: Set(credential.id.clone()),
            name: Set(credential.name.clone()),
            group_name: Set(credential.group.clone()),
        };
        credentials::Entity::insert(model)
            .on_conflict(
                OnConflict::column(credentials::Column::Id)
                    .update_columns([credentials::Column::Name, credentials::Column::GroupName])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        debug!("Saved credential {}", credential.id);
        Ok(())
    }
}

#[async_trait]
impl Inventory for SqliteInventory {
    async fn get_target(&self, id: &str) -> Result<Target, StorageError> {
        let row = servers::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?
            .ok_or(StorageError::NotFound)?;
        Ok(Target {
            id: row.id,
            name: row.name,
            hostname: row.hostname,
            port: u16::try_from(row.port).map_err(|_| StorageError::ReadFailed)?,
            username: row.username,
            group: row.group_name,
        })
    }

    async fn get_credential(&self, id: &str) -> Result<Credential, StorageError> {
        let row = credentials::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?
            .ok_or(StorageError::NotFound)?;
        Ok(Credential {
            id: row.id,
            name: row.name,
            group: row.group_name,
        })
    }
}
