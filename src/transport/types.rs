use std::fmt;

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error_handling::types::TransportError;

/// Where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    /// Key of the host in the trust store.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A public host key as presented by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKey {
    key_type: String,
    key_base64: String,
}

impl HostKey {
    pub fn new(key_type: &str, key_base64: &str) -> Result<Self, TransportError> {
        if key_type.is_empty() || key_type.chars().any(char::is_whitespace) {
            return Err(TransportError::ProbeFailed(format!(
                "malformed key type {:?}",
                key_type
            )));
        }
        STANDARD
            .decode(key_base64.as_bytes())
            .map_err(|_| TransportError::ProbeFailed("malformed host key".to_string()))?;
        Ok(Self {
            key_type: key_type.to_string(),
            key_base64: key_base64.to_string(),
        })
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn key_base64(&self) -> &str {
        &self.key_base64
    }

    /// OpenSSH style `SHA256:<base64 without padding>` fingerprint.
    pub fn fingerprint(&self) -> String {
        let blob = STANDARD.decode(self.key_base64.as_bytes()).unwrap_or_default();
        format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&blob)))
    }
}

/// One way of proving the identity of the remote user.
pub enum AuthMethod {
    PrivateKey(Zeroizing<String>),
    Password(Zeroizing<String>),
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMethod({})", self.kind())
    }
}

/// What to run once connected. The payload travels on stdin.
pub struct RemoteInvocation {
    pub remote_command: String,
    pub stdin: Zeroizing<Vec<u8>>,
}

/// An endpoint whose presented key matched the trust store.
///
/// Only the remote executor creates these, after the trust check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedHost {
    endpoint: Endpoint,
    key: HostKey,
}

impl VerifiedHost {
    pub(crate) fn new(endpoint: Endpoint, key: HostKey) -> Self {
        Self { endpoint, key }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn key(&self) -> &HostKey {
        &self.key
    }
}
