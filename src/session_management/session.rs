use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::TabState;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
const MAX_DIMENSION: u16 = 1000;

/// Operator-visible snapshot of one tab. Holds no secret material.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSession {
    pub id: Uuid,
    pub client: String,
    pub shell: String,
    pub state: TabState,
    pub cols: u16,
    pub rows: u16,
    pub credential_id: Option<String>,
    pub credential_loaded: bool,
    pub created_at: DateTime<Utc>,
}

/// What a new tab should run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabSpec {
    /// Shell name or path, `None` for the first allowed shell
    pub shell: Option<String>,
    pub credential_id: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Messages from the client side of a tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    /// Tears the pseudo-terminal down and starts a fresh one. `None` keeps the
    /// current value; an empty credential id unloads the credential.
    Reconnect {
        shell: Option<String>,
        credential_id: Option<String>,
    },
    Close,
}

/// Messages from a tab to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    Output(Vec<u8>),
    State { session_id: Uuid, state: TabState },
    Error(String),
}

/// Client handle of an open tab.
///
/// Dropping `commands` closes the tab.
pub struct TabChannel {
    pub id: Uuid,
    pub commands: mpsc::Sender<TabCommand>,
    pub events: mpsc::Receiver<TabEvent>,
}

/// Clamps a requested terminal size to something a pty accepts.
pub fn clamp_size(cols: Option<u16>, rows: Option<u16>) -> (u16, u16) {
    let fit = |v: Option<u16>, default: u16| v.filter(|v| *v > 0).unwrap_or(default).min(MAX_DIMENSION);
    (fit(cols, DEFAULT_COLS), fit(rows, DEFAULT_ROWS))
}
