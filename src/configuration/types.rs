use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error_handling::types::ConfigError;

/// Runtime configuration of the service.
///
/// Every field has a default so the service starts without a configuration
/// file. Paths left unset are derived from `data_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub database_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub trust_store_file: Option<PathBuf>,
    /// Audit logging is disabled when unset
    pub audit_log_path: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub vault_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_tabs_per_client: usize,
    pub allowed_shells: Vec<String>,
    /// Interpreter for one-shot commands (`<shell> -c <command>`)
    pub command_shell: String,
    /// Interpreter fed stored scripts on stdin (`<shell> -s`)
    pub script_shell: String,
    /// Reject hosts missing from the trust store instead of pinning them
    pub strict_host_keys: bool,
    pub ssh_connect_timeout_secs: u64,
    /// OS keyring service name used by the `vault:` secret namespace
    pub keyring_service: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8420,
            data_dir: PathBuf::from("./shellward-data"),
            database_file: None,
            key_file: None,
            trust_store_file: None,
            audit_log_path: None,
            command_timeout_secs: 300,
            vault_timeout_secs: 10,
            max_output_bytes: 1024 * 1024,
            max_tabs_per_client: 8,
            allowed_shells: vec!["bash".to_string(), "sh".to_string(), "zsh".to_string()],
            command_shell: "/bin/sh".to_string(),
            script_shell: "bash".to_string(),
            strict_host_keys: false,
            ssh_connect_timeout_secs: 10,
            keyring_service: "shellward".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::BadIPFormatting(self.bind_address.clone()))?;

        for (name, value) in [
            ("command_timeout_secs", self.command_timeout_secs),
            ("vault_timeout_secs", self.vault_timeout_secs),
            ("ssh_connect_timeout_secs", self.ssh_connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::NotInRange(format!("{} must be > 0", name)));
            }
        }
        if self.max_tabs_per_client == 0 {
            return Err(ConfigError::NotInRange(
                "max_tabs_per_client must be > 0".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::NotInRange(
                "max_output_bytes must be > 0".to_string(),
            ));
        }
        if self.allowed_shells.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::ShellsEmpty(
                "allowed_shells must name at least one shell".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::BadIPFormatting(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("shellward.sqlite3"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("data.key"))
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.trust_store_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("known_hosts.json"))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn vault_timeout(&self) -> Duration {
        Duration::from_secs(self.vault_timeout_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.command_timeout(), Duration::from_secs(300));
        assert_eq!(config.vault_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.database_path(),
            PathBuf::from("./shellward-data/shellward.sqlite3")
        );
        assert!(config.audit_log_path.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        config.command_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        let mut config = Config::default();
        config.max_tabs_per_client = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        let mut config = Config::default();
        config.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadIPFormatting(_))
        ));

        let mut config = Config::default();
        config.allowed_shells = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::ShellsEmpty(_))));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            port = 9000
            strict_host_keys = true
            allowed_shells = ["bash"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.strict_host_keys);
        assert_eq!(config.allowed_shells, vec!["bash".to_string()]);
        assert_eq!(config.vault_timeout_secs, 10);
    }
}
