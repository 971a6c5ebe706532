use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::audit_log::AuditLog;
use super::types::{AuditOperation, AuditOutcome, HistoryEntry, HistoryStatus, HistoryView};
use crate::crypto::{EncryptedBlob, EncryptionService};
use crate::error_handling::types::{CryptoError, ExecutionError, StorageError};
use crate::execution::types::ExecutionResult;
use crate::storage::HistoryStore;

/// What the dispatcher knows about a run before it starts.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: Uuid,
    /// Command text, or a reference to the stored script
    pub command_text: String,
    pub target_label: String,
    pub identity: String,
    pub started_at: DateTime<Utc>,
}

fn command_aad(id: Uuid) -> Vec<u8> {
    format!("history/{}/command", id).into_bytes()
}

fn output_aad(id: Uuid) -> Vec<u8> {
    format!("history/{}/output", id).into_bytes()
}

/// Persists one encrypted [`HistoryEntry`] per one-shot execution and serves
/// decrypted views back.
pub struct HistoryRecorder {
    store: HistoryStore,
    crypto: Arc<EncryptionService>,
    audit: Arc<AuditLog>,
}

impl HistoryRecorder {
    pub fn new(store: HistoryStore, crypto: Arc<EncryptionService>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            crypto,
            audit,
        }
    }

    /// Records a finished run. Returns `None` for outcomes that are never
    /// recorded (rejected requests).
    pub async fn record(
        &self,
        summary: &RunSummary,
        outcome: &Result<ExecutionResult, ExecutionError>,
    ) -> Result<Option<HistoryEntry>, StorageError> {
        let (output, exit_code, status, duration_ms, timed_out, truncated) = match outcome {
            Ok(result) => (
                result.output.clone(),
                result.exit_code,
                if result.timed_out {
                    HistoryStatus::TimedOut
                } else {
                    HistoryStatus::Completed
                },
                result.duration_ms,
                result.timed_out,
                result.truncated,
            ),
            Err(err) => {
                let Some(status) = HistoryStatus::from_error(err) else {
                    return Ok(None);
                };
                let elapsed = (Utc::now() - summary.started_at).num_milliseconds();
                (
                    err.to_string(),
                    None,
                    status,
                    u64::try_from(elapsed).unwrap_or(0),
                    false,
                    false,
                )
            }
        };

        let entry = HistoryEntry {
            id: summary.id,
            command: self.seal(summary.command_text.as_bytes(), &command_aad(summary.id))?,
            output: self.seal(output.as_bytes(), &output_aad(summary.id))?,
            exit_code,
            target_label: summary.target_label.clone(),
            identity: summary.identity.clone(),
            status,
            started_at: summary.started_at,
            duration_ms,
            timed_out,
            truncated,
        };
        self.store.insert(&entry).await?;
        debug!("[{}] History recorded with status {}", entry.id, status.as_str());
        Ok(Some(entry))
    }

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedBlob, StorageError> {
        self.crypto.encrypt(plaintext, aad).map_err(|e| {
            error!("Cannot encrypt history entry: {}", e);
            StorageError::WriteFailed
        })
    }

    /// Newest first. Entries that cannot be decrypted are left out; their
    /// failed decrypt is already in the audit log.
    pub async fn list(&self, limit: u64) -> Result<Vec<HistoryView>, StorageError> {
        let entries = self.store.list(limit).await?;
        let mut views = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.open(entry) {
                Ok(view) => views.push(view),
                Err(_) => warn!("[{}] Skipping unreadable history entry", entry.id),
            }
        }
        Ok(views)
    }

    pub async fn get(&self, id: Uuid) -> Result<HistoryView, StorageError> {
        let entry = self.store.get(id).await?;
        self.open(&entry)
    }

    fn decrypt_pair(
        &self,
        entry: &HistoryEntry,
    ) -> Result<(Zeroizing<String>, Zeroizing<String>), CryptoError> {
        let command = self
            .crypto
            .decrypt_string(&entry.command, &command_aad(entry.id))?;
        let output = self
            .crypto
            .decrypt_string(&entry.output, &output_aad(entry.id))?;
        Ok((command, output))
    }

    fn open(&self, entry: &HistoryEntry) -> Result<HistoryView, StorageError> {
        let opened = self.decrypt_pair(entry);
        self.audit.record(
            AuditOperation::Decrypt,
            &format!("history:{}", entry.id),
            AuditOutcome::of(&opened),
        );
        let (command, output) = opened.map_err(|e| {
            error!("[{}] History entry cannot be decrypted: {}", entry.id, e);
            StorageError::ReadFailed
        })?;

        Ok(HistoryView {
            id: entry.id,
            command: command.to_string(),
            output: output.to_string(),
            exit_code: entry.exit_code,
            target_label: entry.target_label.clone(),
            identity: entry.identity.clone(),
            status: entry.status,
            started_at: entry.started_at,
            duration_ms: entry.duration_ms,
            timed_out: entry.timed_out,
            truncated: entry.truncated,
        })
    }
}
