use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Where a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTarget {
    Local,
    Remote {
        target_id: String,
        credential_id: Option<String>,
    },
}

/// What a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionPayload {
    Command(String),
    /// A stored script plus the stored variables exported before it runs
    Script {
        script_id: String,
        variable_ids: Vec<String>,
    },
}

/// One run intent, built per API call and dropped after use.
///
/// `password` authenticates to a remote target, `sudo_password` elevates a
/// local run. Both are wiped from memory when the request is dropped.
pub struct ExecutionRequest {
    pub payload: ExecutionPayload,
    pub run_as: Option<String>,
    pub target: ExecutionTarget,
    pub password: Option<Zeroizing<String>>,
    pub sudo_password: Option<Zeroizing<String>>,
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(payload: ExecutionPayload, target: ExecutionTarget) -> Self {
        Self {
            payload,
            run_as: None,
            target,
            password: None,
            sudo_password: None,
            timeout: None,
        }
    }

    pub fn local_command(command: impl Into<String>) -> Self {
        Self::new(
            ExecutionPayload::Command(command.into()),
            ExecutionTarget::Local,
        )
    }

    pub fn run_as(mut self, identity: impl Into<String>) -> Self {
        self.run_as = Some(identity.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn with_sudo_password(mut self, password: impl Into<String>) -> Self {
        self.sudo_password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("payload", &self.payload)
            .field("run_as", &self.run_as)
            .field("target", &self.target)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Outcome of one run.
///
/// `exit_code` is `None` when the process was killed (timeout) or reported no
/// status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub timed_out: bool,
    pub truncated: bool,
}
