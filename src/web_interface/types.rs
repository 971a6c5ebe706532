use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::StatusCode;

use crate::error_handling::types::{ExecutionError, StorageError, TerminalError};
use crate::execution::{ExecutionPayload, ExecutionRequest, ExecutionTarget};
use crate::session_management::{TabCommand, TabSpec, TabState};

pub const DEFAULT_HISTORY_LIMIT: u64 = 50;
pub const MAX_HISTORY_LIMIT: u64 = 500;

/// Fields shared by both execute endpoints. Passwords are moved into the
/// request and wiped with it.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub run_as: Option<String>,
    pub server_id: Option<String>,
    pub ssh_key_id: Option<String>,
    pub password: Option<String>,
    pub sudo_password: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Body of `POST /commands/execute`.
#[derive(Deserialize)]
pub struct CommandBody {
    pub command: String,
    #[serde(flatten)]
    pub options: RunOptions,
}

/// Body of `POST /bash-scripts/execute` and its streaming variant.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptBody {
    pub script_id: String,
    #[serde(default)]
    pub variable_ids: Vec<String>,
    #[serde(flatten)]
    pub options: RunOptions,
}

impl RunOptions {
    fn into_request(self, payload: ExecutionPayload) -> Result<ExecutionRequest, ExecutionError> {
        let target = match (self.server_id, self.ssh_key_id) {
            (Some(target_id), credential_id) => ExecutionTarget::Remote {
                target_id,
                credential_id,
            },
            (None, None) => ExecutionTarget::Local,
            (None, Some(_)) => {
                return Err(ExecutionError::InvalidRequest(
                    "sshKeyId requires serverId".to_string(),
                ))
            }
        };
        let mut request = ExecutionRequest::new(payload, target);
        request.run_as = self.run_as.filter(|r| !r.is_empty());
        if let Some(password) = self.password.filter(|p| !p.is_empty()) {
            request = request.with_password(password);
        }
        if let Some(password) = self.sudo_password.filter(|p| !p.is_empty()) {
            request = request.with_sudo_password(password);
        }
        if let Some(secs) = self.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        Ok(request)
    }
}

impl CommandBody {
    pub fn into_request(self) -> Result<ExecutionRequest, ExecutionError> {
        self.options
            .into_request(ExecutionPayload::Command(self.command))
    }
}

impl ScriptBody {
    pub fn into_request(self) -> Result<ExecutionRequest, ExecutionError> {
        self.options.into_request(ExecutionPayload::Script {
            script_id: self.script_id,
            variable_ids: self.variable_ids,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u64>,
}

impl HistoryQuery {
    pub fn effective_limit(&self) -> u64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

/// Connection parameters of `GET /terminal`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    pub shell: Option<String>,
    pub ssh_key_id: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl TerminalQuery {
    pub fn into_spec(self) -> TabSpec {
        TabSpec {
            shell: self.shell,
            credential_id: self.ssh_key_id.filter(|k| !k.is_empty()),
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// JSON control frames a terminal client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Resize {
        cols: u16,
        rows: u16,
    },
    Input {
        data: String,
    },
    Reconnect {
        shell: Option<String>,
        #[serde(rename = "sshKeyId")]
        ssh_key_id: Option<String>,
    },
}

/// Interprets a text frame. Text frames carry only control envelopes, so
/// anything else is `None`; raw keystrokes and pastes travel as binary
/// frames or inside `{"type":"input"}`.
pub fn parse_client_frame(text: &str) -> Option<TabCommand> {
    let command = match serde_json::from_str::<ClientFrame>(text).ok()? {
        ClientFrame::Resize { cols, rows } => TabCommand::Resize { cols, rows },
        ClientFrame::Input { data } => TabCommand::Input(data.into_bytes()),
        ClientFrame::Reconnect { shell, ssh_key_id } => TabCommand::Reconnect {
            shell,
            credential_id: ssh_key_id,
        },
    };
    Some(command)
}

/// JSON frames sent to a terminal client next to raw output.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Status {
        state: TabState,
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub encryption: &'static str,
}

/// Error payload of every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub security: bool,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            security: false,
        }
    }
}

const INTERNAL_MESSAGE: &str = "Internal server error";

pub fn execution_error(err: &ExecutionError) -> (StatusCode, ApiError) {
    let status = match err {
        ExecutionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ExecutionError::NotFound(_) => StatusCode::NOT_FOUND,
        ExecutionError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        ExecutionError::ElevationFailed => StatusCode::FORBIDDEN,
        ExecutionError::HostKeyMismatch(_) | ExecutionError::UnknownHost(_) => StatusCode::CONFLICT,
        ExecutionError::ConnectionFailed(_) => StatusCode::BAD_GATEWAY,
        ExecutionError::Secret(_) | ExecutionError::SpawnFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        INTERNAL_MESSAGE.to_string()
    } else {
        err.to_string()
    };
    (
        status,
        ApiError {
            message,
            kind: Some(err.kind().to_string()),
            security: err.is_security_event(),
        },
    )
}

/// Also supplies the message of terminal socket error frames. Credential
/// details stay in the server log.
pub fn terminal_error(err: &TerminalError) -> (StatusCode, ApiError) {
    match err {
        TerminalError::NotFound => (StatusCode::NOT_FOUND, ApiError::new(err.to_string())),
        TerminalError::TabLimitReached => {
            (StatusCode::TOO_MANY_REQUESTS, ApiError::new(err.to_string()))
        }
        TerminalError::ShellNotAllowed(_) => (StatusCode::BAD_REQUEST, ApiError::new(err.to_string())),
        TerminalError::Secret(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiError::new("Credential could not be loaded"),
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, ApiError::new(err.to_string())),
    }
}

pub fn history_error(err: &StorageError) -> (StatusCode, ApiError) {
    match err {
        StorageError::NotFound => (StatusCode::NOT_FOUND, ApiError::new("History entry not found")),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, ApiError::new(INTERNAL_MESSAGE)),
    }
}
