//! Common data types of the recording subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedBlob;
use crate::error_handling::types::ExecutionError;

/// Final classification of a recorded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    TimedOut,
    NotFound,
    SecretUnavailable,
    HostKeyMismatch,
    UnknownHost,
    AuthenticationFailed,
    ElevationFailed,
    ConnectionFailed,
    SpawnFailed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Completed => "completed",
            HistoryStatus::TimedOut => "timed_out",
            HistoryStatus::NotFound => "not_found",
            HistoryStatus::SecretUnavailable => "secret_unavailable",
            HistoryStatus::HostKeyMismatch => "host_key_mismatch",
            HistoryStatus::UnknownHost => "unknown_host",
            HistoryStatus::AuthenticationFailed => "authentication_failed",
            HistoryStatus::ElevationFailed => "elevation_failed",
            HistoryStatus::ConnectionFailed => "connection_failed",
            HistoryStatus::SpawnFailed => "spawn_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "completed" => HistoryStatus::Completed,
            "timed_out" => HistoryStatus::TimedOut,
            "not_found" => HistoryStatus::NotFound,
            "secret_unavailable" => HistoryStatus::SecretUnavailable,
            "host_key_mismatch" => HistoryStatus::HostKeyMismatch,
            "unknown_host" => HistoryStatus::UnknownHost,
            "authentication_failed" => HistoryStatus::AuthenticationFailed,
            "elevation_failed" => HistoryStatus::ElevationFailed,
            "connection_failed" => HistoryStatus::ConnectionFailed,
            "spawn_failed" => HistoryStatus::SpawnFailed,
            _ => return None,
        };
        Some(status)
    }

    /// Invalid requests are never recorded, so they have no status.
    pub fn from_error(err: &ExecutionError) -> Option<Self> {
        match err {
            ExecutionError::InvalidRequest(_) => None,
            other => HistoryStatus::parse(other.kind()),
        }
    }
}

/// Persisted form of one execution.
///
/// Carries no field for any password of the originating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub command: EncryptedBlob,
    pub output: EncryptedBlob,
    pub exit_code: Option<i32>,
    pub target_label: String,
    pub identity: String,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Decrypted history entry returned by the history API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub id: Uuid,
    pub command: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub target_label: String,
    pub identity: String,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Decrypt,
    Authentication,
    HostKeyTrust,
    Elevation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        }
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    /// Opaque identifier of what was acted on (secret id, host identity, ...)
    pub subject: String,
    pub outcome: AuditOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            HistoryStatus::Completed,
            HistoryStatus::TimedOut,
            HistoryStatus::HostKeyMismatch,
            HistoryStatus::AuthenticationFailed,
            HistoryStatus::ElevationFailed,
        ] {
            assert_eq!(HistoryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(HistoryStatus::parse("bogus"), None);
    }

    #[test]
    fn test_status_from_error() {
        assert_eq!(
            HistoryStatus::from_error(&ExecutionError::AuthenticationFailed),
            Some(HistoryStatus::AuthenticationFailed)
        );
        assert_eq!(
            HistoryStatus::from_error(&ExecutionError::InvalidRequest("empty".into())),
            None
        );
    }

    #[test]
    fn test_audit_record_json_shape() {
        let record = AuditRecord {
            timestamp: Utc::now(),
            operation: AuditOperation::HostKeyTrust,
            subject: "db.internal:22".to_string(),
            outcome: AuditOutcome::Failure,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operation"], "host_key_trust");
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["subject"], "db.internal:22");
    }
}
