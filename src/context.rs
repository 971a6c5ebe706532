//! Application context: every long-lived component, built once at startup
//! and shared by reference.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use log::{info, warn};

use crate::configuration::Config;
use crate::crypto::{load_data_key, EncryptionService, KeySource};
use crate::error_handling::types::{ControllerError, CryptoError};
use crate::execution::local_runner::current_identity;
use crate::execution::{ExecLimits, ExecutionDispatcher, LocalRunner};
use crate::recording::{AuditLog, HistoryRecorder};
use crate::secrets::{KeyringVault, LocalSecretStore, SecretAggregator, SecretProvider};
use crate::session_management::{PortablePtyBackend, PtyBackend, TerminalManager};
use crate::storage::{database, HistoryStore, SqliteInventory};
use crate::transport::{RemoteExecutor, SshTransport, Transport, TrustStore};

pub struct AppContext {
    pub config: Config,
    pub crypto: Arc<EncryptionService>,
    pub audit: Arc<AuditLog>,
    pub secrets: Arc<SecretAggregator>,
    pub inventory: Arc<SqliteInventory>,
    pub dispatcher: Arc<ExecutionDispatcher>,
    pub terminals: Arc<TerminalManager>,
}

/// Loads the data key. An unverifiable entropy pool leaves the service up
/// with encryption unavailable; any other failure is fatal.
pub fn load_encryption(config: &Config) -> Result<EncryptionService, ControllerError> {
    match load_data_key(&config.key_path()) {
        Ok((key, source)) => {
            match source {
                KeySource::Environment => info!("Using data key from the environment"),
                KeySource::File(path) => info!("Using data key from {}", path.display()),
                KeySource::Generated(path) => warn!("Generated a new data key at {}", path.display()),
            }
            Ok(EncryptionService::new(key))
        }
        Err(CryptoError::EntropyUnverified) => {
            warn!("Encryption unavailable until a data key is provided");
            Ok(EncryptionService::unavailable())
        }
        Err(e) => Err(ControllerError::CryptoError(e)),
    }
}

impl AppContext {
    /// Builds the context with the system SSH client and native ptys.
    pub async fn build(config: Config) -> Result<Self, ControllerError> {
        prepare_data_dir(&config)?;
        let crypto = load_encryption(&config)?;
        let transport = SshTransport::discover(config.ssh_connect_timeout())
            .map_err(ControllerError::TransportError)?;
        Self::build_with(config, crypto, Arc::new(transport), Arc::new(PortablePtyBackend)).await
    }

    /// Builds the context around the given transport and pty backend.
    pub async fn build_with(
        config: Config,
        crypto: EncryptionService,
        transport: Arc<dyn Transport>,
        pty: Arc<dyn PtyBackend>,
    ) -> Result<Self, ControllerError> {
        prepare_data_dir(&config)?;
        let crypto = Arc::new(crypto);
        let audit = Arc::new(
            AuditLog::open(config.audit_log_path.as_deref()).map_err(ControllerError::AuditError)?,
        );
        let db = database::connect(&config.database_path())
            .await
            .map_err(ControllerError::StorageError)?;

        let local_store: Arc<dyn SecretProvider> =
            Arc::new(LocalSecretStore::new(db.clone(), crypto.clone()));
        let vault: Arc<dyn SecretProvider> = Arc::new(KeyringVault::new(config.keyring_service.clone()));
        let secrets = Arc::new(SecretAggregator::new(
            local_store,
            Some(vault),
            config.vault_timeout(),
            audit.clone(),
        ));

        let trust = Arc::new(
            TrustStore::load(&config.trust_store_path(), config.strict_host_keys)
                .map_err(ControllerError::TransportError)?,
        );
        let inventory = Arc::new(SqliteInventory::new(db.clone()));
        let identity = current_identity().await;
        info!("Local runs execute as {}", identity);

        let dispatcher = Arc::new(ExecutionDispatcher::new(
            inventory.clone(),
            secrets.clone(),
            LocalRunner::new(
                config.command_shell.clone(),
                config.script_shell.clone(),
                identity,
                audit.clone(),
            ),
            RemoteExecutor::new(transport, trust, audit.clone()),
            HistoryRecorder::new(HistoryStore::new(db), crypto.clone(), audit.clone()),
            ExecLimits {
                timeout: config.command_timeout(),
                max_output: config.max_output_bytes,
            },
            config.script_shell.clone(),
        ));
        let terminals = Arc::new(TerminalManager::new(
            pty,
            secrets.clone(),
            config.allowed_shells.clone(),
            config.max_tabs_per_client,
        ));

        Ok(Self {
            config,
            crypto,
            audit,
            secrets,
            inventory,
            dispatcher,
            terminals,
        })
    }
}

fn prepare_data_dir(config: &Config) -> Result<(), ControllerError> {
    let io_err = |e: std::io::Error| {
        ControllerError::InitializationFailed(format!(
            "cannot prepare {}: {}",
            config.data_dir.display(),
            e
        ))
    };
    if !config.data_dir.exists() {
        fs::create_dir_all(&config.data_dir).map_err(io_err)?;
        fs::set_permissions(&config.data_dir, fs::Permissions::from_mode(0o700)).map_err(io_err)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::test_context;
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn test_build_with_creates_private_data_dir() {
        let (dir, ctx) = test_context().await;
        let mode = fs::metadata(dir.path().join("data")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(ctx.crypto.is_ready());
        assert!(ctx.config.database_path().exists());
    }

    #[test]
    #[serial]
    fn test_load_encryption_generates_key_file() {
        std::env::remove_var(crate::crypto::key_loader::KEY_ENV);
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let service = load_encryption(&config).unwrap();
        if service.is_ready() {
            assert!(config.key_path().exists());
        }
    }
}
