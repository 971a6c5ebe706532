use serde::{Deserialize, Serialize};

/// A remote host commands can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub group: Option<String>,
}

impl Target {
    /// Human readable label stored in history rows.
    pub fn label(&self) -> String {
        format!("{} ({}:{})", self.name, self.hostname, self.port)
    }
}

/// Metadata of a reusable SSH identity. The private key is stored as the
/// secret (`credential`, `id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub group: Option<String>,
}
