use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::{error, info};

use super::types::{AuditOperation, AuditOutcome, AuditRecord};
use crate::error_handling::types::AuditError;

/// Append-only JSON-lines audit trail.
///
/// Writes are serialized through a mutex so concurrent records never
/// interleave within a line. A log opened without a path records nothing.
pub struct AuditLog {
    path: Option<PathBuf>,
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn open(path: Option<&Path>) -> Result<Self, AuditError> {
        let Some(path) = path else {
            info!("Audit logging disabled");
            return Ok(Self::disabled());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        info!("Audit log at {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            sink: Some(Mutex::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            sink: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one record. Failures are logged and do not abort the audited
    /// operation.
    pub fn record(&self, operation: AuditOperation, subject: &str, outcome: AuditOutcome) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            operation,
            subject: subject.to_string(),
            outcome,
        };
        if let Err(e) = self.append(&record) {
            error!(
                "Failed to append audit record {:?} for {}: {}",
                operation, subject, e
            );
        }
    }

    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let mut line = serde_json::to_string(record)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = sink
            .lock()
            .map_err(|_| AuditError::IoError(io::Error::other("audit log lock poisoned")))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
