use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::crypto::EncryptedBlob;
use crate::error_handling::types::StorageError;
use crate::recording::types::{HistoryEntry, HistoryStatus};
use crate::storage::db_entities::history;

/// Append-only persistence of [`HistoryEntry`] rows.
pub struct HistoryStore {
    db: DatabaseConnection,
}

impl HistoryStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        let model = history::ActiveModel {
            id: Set(entry.id.to_string()),
            command: Set(entry.command.encode()),
            output: Set(entry.output.encode()),
            exit_code: Set(entry.exit_code),
            target_label: Set(entry.target_label.clone()),
            identity: Set(entry.identity.clone()),
            status: Set(entry.status.as_str().to_string()),
            started_at: Set(entry.started_at.to_rfc3339()),
            duration_ms: Set(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX)),
            timed_out: Set(entry.timed_out),
            truncated: Set(entry.truncated),
        };
        history::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    /// Newest first.
    pub async fn list(&self, limit: u64) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = history::Entity::find()
            .order_by_desc(history::Column::StartedAt)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        rows.into_iter().map(into_entry).collect()
    }

    pub async fn get(&self, id: Uuid) -> Result<HistoryEntry, StorageError> {
        let row = history::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?
            .ok_or(StorageError::NotFound)?;
        into_entry(row)
    }
}

fn into_entry(row: history::Model) -> Result<HistoryEntry, StorageError> {
    Ok(HistoryEntry {
        id: Uuid::parse_str(&row.id).map_err(|_| StorageError::ReadFailed)?,
        command: EncryptedBlob::decode(&row.command).map_err(|_| StorageError::ReadFailed)?,
        output: EncryptedBlob::decode(&row.output).map_err(|_| StorageError::ReadFailed)?,
        exit_code: row.exit_code,
        target_label: row.target_label,
        identity: row.identity,
        status: HistoryStatus::parse(&row.status).ok_or(StorageError::ReadFailed)?,
        started_at: DateTime::parse_from_rfc3339(&row.started_at)
            .map_err(|_| StorageError::ReadFailed)?
            .with_timezone(&Utc),
        duration_ms: u64::try_from(row.duration_ms).map_err(|_| StorageError::ReadFailed)?,
        timed_out: row.timed_out,
        truncated: row.truncated,
    })
}
