use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadIPFormatting(String),
    NotInRange(String),
    ShellsEmpty(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::ShellsEmpty(e) => write!(f, "Shell configuration error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures of the envelope encryption layer.
///
/// `AuthFailure` covers every decrypt failure (wrong key, tampered or
/// malformed ciphertext) and never says which one happened.
#[derive(Debug)]
pub enum CryptoError {
    AuthFailure,
    KeyUnavailable,
    PayloadTooLarge(usize),
    InvalidKey(String),
    KeyFileInsecure(String),
    EntropyUnverified,
    IoError(std::io::Error),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::AuthFailure => write!(f, "Authentication failure"),
            CryptoError::KeyUnavailable => write!(f, "Data key is not available"),
            CryptoError::PayloadTooLarge(n) => write!(f, "Payload of {} bytes is too large", n),
            CryptoError::InvalidKey(e) => write!(f, "Invalid data key: {}", e),
            CryptoError::KeyFileInsecure(e) => write!(f, "Key file permissions too open: {}", e),
            CryptoError::EntropyUnverified => {
                write!(f, "OS entropy pool could not be verified as seeded")
            }
            CryptoError::IoError(e) => write!(f, "Key file IO error: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::IoError(err)
    }
}

#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed,
    WriteFailed,
    ReadFailed,
    NotFound,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed => write!(f, "Storage connection failed"),
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
            StorageError::NotFound => write!(f, "Record not found"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum SecretError {
    NotFound,
    InvalidIdentifier(String),
    Crypto(CryptoError),
    Storage(StorageError),
    Vault(String),
    VaultTimeout,
    NotText,
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::NotFound => write!(f, "Secret not found"),
            SecretError::InvalidIdentifier(e) => write!(f, "Invalid secret identifier: {}", e),
            SecretError::Crypto(e) => write!(f, "Secret crypto error: {}", e),
            SecretError::Storage(e) => write!(f, "Secret storage error: {}", e),
            SecretError::Vault(e) => write!(f, "Vault backend error: {}", e),
            SecretError::VaultTimeout => write!(f, "Vault operation timed out"),
            SecretError::NotText => write!(f, "Secret is not valid UTF-8 text"),
        }
    }
}

impl std::error::Error for SecretError {}

impl From<CryptoError> for SecretError {
    fn from(err: CryptoError) -> Self {
        SecretError::Crypto(err)
    }
}

impl From<StorageError> for SecretError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => SecretError::NotFound,
            other => SecretError::Storage(other),
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    /// The presented host key differs from the pinned one. Nothing was sent.
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },
    UnknownHost(String),
    AuthenticationFailed,
    ProbeFailed(String),
    ConnectionFailed(String),
    Agent(String),
    TrustStore(String),
    IoError(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::HostKeyMismatch {
                host,
                expected,
                presented,
            } => write!(
                f,
                "SECURITY: host key mismatch for {} (pinned {}, presented {})",
                host, expected, presented
            ),
            TransportError::UnknownHost(h) => write!(f, "Unknown host rejected: {}", h),
            TransportError::AuthenticationFailed => write!(f, "Authentication failed"),
            TransportError::ProbeFailed(e) => write!(f, "Host key probe failed: {}", e),
            TransportError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            TransportError::Agent(e) => write!(f, "Key agent error: {}", e),
            TransportError::TrustStore(e) => write!(f, "Trust store error: {}", e),
            TransportError::IoError(e) => write!(f, "Transport IO error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err)
    }
}

#[derive(Debug)]
pub enum ExecutionError {
    InvalidRequest(String),
    NotFound(String),
    Secret(SecretError),
    HostKeyMismatch(String),
    UnknownHost(String),
    AuthenticationFailed,
    ElevationFailed,
    ConnectionFailed(String),
    SpawnFailed(String),
}

impl ExecutionError {
    /// Stable classification used in history rows and stream error events.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::InvalidRequest(_) => "invalid_request",
            ExecutionError::NotFound(_) => "not_found",
            ExecutionError::Secret(_) => "secret_unavailable",
            ExecutionError::HostKeyMismatch(_) => "host_key_mismatch",
            ExecutionError::UnknownHost(_) => "unknown_host",
            ExecutionError::AuthenticationFailed => "authentication_failed",
            ExecutionError::ElevationFailed => "elevation_failed",
            ExecutionError::ConnectionFailed(_) => "connection_failed",
            ExecutionError::SpawnFailed(_) => "spawn_failed",
        }
    }

    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ExecutionError::HostKeyMismatch(_) | ExecutionError::UnknownHost(_)
        )
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::InvalidRequest(e) => write!(f, "Invalid request: {}", e),
            ExecutionError::NotFound(e) => write!(f, "Not found: {}", e),
            ExecutionError::Secret(SecretError::Crypto(_)) => {
                write!(f, "Stored secret could not be decrypted")
            }
            ExecutionError::Secret(e) => write!(f, "Secret unavailable: {}", e),
            ExecutionError::HostKeyMismatch(h) => {
                write!(f, "SECURITY: host key for {} does not match the pinned key", h)
            }
            ExecutionError::UnknownHost(h) => write!(f, "Host {} is not trusted", h),
            ExecutionError::AuthenticationFailed => write!(f, "Authentication failed"),
            ExecutionError::ElevationFailed => write!(f, "Privilege elevation failed"),
            ExecutionError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            ExecutionError::SpawnFailed(e) => write!(f, "Process spawn failed: {}", e),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<SecretError> for ExecutionError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::NotFound => ExecutionError::NotFound("secret".to_string()),
            SecretError::InvalidIdentifier(e) => ExecutionError::InvalidRequest(e),
            other => ExecutionError::Secret(other),
        }
    }
}

impl From<TransportError> for ExecutionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HostKeyMismatch { host, .. } => ExecutionError::HostKeyMismatch(host),
            TransportError::UnknownHost(h) => ExecutionError::UnknownHost(h),
            TransportError::AuthenticationFailed => ExecutionError::AuthenticationFailed,
            TransportError::ProbeFailed(e) | TransportError::ConnectionFailed(e) => {
                ExecutionError::ConnectionFailed(e)
            }
            TransportError::Agent(e) | TransportError::TrustStore(e) => {
                ExecutionError::SpawnFailed(e)
            }
            TransportError::IoError(e) => ExecutionError::SpawnFailed(e.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum TerminalError {
    NotFound,
    TabLimitReached,
    ShellNotAllowed(String),
    Spawn(String),
    Secret(SecretError),
    Agent(String),
    Closed,
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalError::NotFound => write!(f, "Terminal session not found"),
            TerminalError::TabLimitReached => write!(f, "Terminal tab limit reached"),
            TerminalError::ShellNotAllowed(s) => write!(f, "Shell not allowed: {}", s),
            TerminalError::Spawn(e) => write!(f, "Terminal spawn error: {}", e),
            TerminalError::Secret(SecretError::Crypto(_)) => {
                write!(f, "Credential could not be decrypted")
            }
            TerminalError::Secret(e) => write!(f, "Credential unavailable: {}", e),
            TerminalError::Agent(e) => write!(f, "Key agent error: {}", e),
            TerminalError::Closed => write!(f, "Terminal session closed"),
        }
    }
}

impl std::error::Error for TerminalError {}

impl From<SecretError> for TerminalError {
    fn from(err: SecretError) -> Self {
        TerminalError::Secret(err)
    }
}

#[derive(Debug)]
pub enum AuditError {
    IoError(std::io::Error),
    Serialization(String),
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::IoError(e) => write!(f, "Audit log IO error: {}", e),
            AuditError::Serialization(e) => write!(f, "Audit record serialization error: {}", e),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::IoError(err)
    }
}

#[derive(Debug)]
pub enum WebError {
    BindFailed(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindFailed(e) => write!(f, "Web server bind failed: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    CryptoError(CryptoError),
    StorageError(StorageError),
    TransportError(TransportError),
    AuditError(AuditError),
    WebError(WebError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::CryptoError(e) => write!(f, "Crypto error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::TransportError(e) => write!(f, "Transport error: {}", e),
            ControllerError::AuditError(e) => write!(f, "Audit error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_failures_do_not_leak_cause() {
        let err = ExecutionError::Secret(SecretError::Crypto(CryptoError::AuthFailure));
        let text = err.to_string();
        assert!(!text.contains("key"));
        assert!(!text.contains("tamper"));
        assert_eq!(err.kind(), "secret_unavailable");
    }

    #[test]
    fn transport_errors_map_to_execution_classes() {
        let mismatch = TransportError::HostKeyMismatch {
            host: "db:22".into(),
            expected: "SHA256:a".into(),
            presented: "SHA256:b".into(),
        };
        let err: ExecutionError = mismatch.into();
        assert_eq!(err.kind(), "host_key_mismatch");
        assert!(err.is_security_event());

        let err: ExecutionError = TransportError::AuthenticationFailed.into();
        assert_eq!(err.to_string(), "Authentication failed");
    }

    #[test]
    fn missing_secret_is_not_found() {
        let err: ExecutionError = SecretError::from(StorageError::NotFound).into();
        assert_eq!(err.kind(), "not_found");
    }
}
