//! Interactive terminal tabs.
//!
//! Each tab owns one pseudo-terminal running a local shell, bridged to one
//! client channel by its own task. A tab can carry an ephemeral key agent
//! loaded with a stored credential so that `ssh` typed inside the shell can
//! authenticate without the key ever touching disk.

use serde::{Deserialize, Serialize};

/// Pseudo-terminal backends.
pub mod pty;
/// Tab snapshots, commands and events.
pub mod session;
/// The tab registry and per-tab tasks.
pub mod session_manager;

pub use pty::{PortablePtyBackend, PtyBackend, PtyControl, PtyProcess, PtySpec};
pub use session::{TabChannel, TabCommand, TabEvent, TabSpec, TerminalSession};
pub use session_manager::TerminalManager;

/// Lifecycle of one tab.
///
/// `Created -> Connecting -> Connected -> (Reconnecting -> Connected)* -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabState {
    Created,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}
