//! History and audit recording.
//!
//! `history_recorder` persists one encrypted [`HistoryEntry`] per one-shot
//! execution. `audit_log` appends plaintext [`AuditRecord`]s that carry only
//! opaque identifiers, never secret values.

pub mod audit_log;
pub mod history_recorder;
pub mod types;

pub use audit_log::AuditLog;
pub use history_recorder::{HistoryRecorder, RunSummary};
pub use types::{AuditOperation, AuditOutcome, AuditRecord, HistoryEntry, HistoryStatus, HistoryView};
