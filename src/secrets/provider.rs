use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error_handling::types::SecretError;

static SECRET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._@-]{0,127}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    /// SSH private key of a credential record
    Credential,
    /// Body of a stored script
    Script,
    /// Value of a stored variable
    Variable,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Credential => "credential",
            SecretKind::Script => "script",
            SecretKind::Variable => "variable",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which provider served a secret. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretOrigin {
    Local,
    Vault,
}

/// A decrypted secret. The bytes are wiped when the value is dropped.
pub struct SecretValue {
    origin: SecretOrigin,
    bytes: Zeroizing<Vec<u8>>,
}

impl SecretValue {
    pub fn new(origin: SecretOrigin, bytes: Zeroizing<Vec<u8>>) -> Self {
        Self { origin, bytes }
    }

    pub fn origin(&self) -> SecretOrigin {
        self.origin
    }

    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn expose_str(&self) -> Result<&str, SecretError> {
        std::str::from_utf8(&self.bytes).map_err(|_| SecretError::NotText)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("origin", &self.origin)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Read/write contract shared by every secret backend.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    fn origin(&self) -> SecretOrigin;

    async fn get_decrypted(
        &self,
        kind: SecretKind,
        id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecretError>;

    async fn put_encrypted(
        &self,
        kind: SecretKind,
        id: &str,
        plaintext: &[u8],
    ) -> Result<(), SecretError>;

    async fn delete(&self, kind: SecretKind, id: &str) -> Result<(), SecretError>;
}

pub fn validate_id(id: &str) -> Result<(), SecretError> {
    if SECRET_ID.is_match(id) {
        Ok(())
    } else {
        Err(SecretError::InvalidIdentifier(format!(
            "malformed secret reference {:?}",
            id
        )))
    }
}
