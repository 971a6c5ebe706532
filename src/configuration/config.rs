use std::fs;
use std::path::PathBuf;

use clap::Parser;
use log::debug;

use super::types::Config;
use crate::error_handling::types::ConfigError;

/// Command-line interface of the service.
///
/// The optional positional argument is a TOML configuration file. The flags
/// override values read from it and can also be set through `SHELLWARD_*`
/// environment variables.
///
/// # Examples
///
/// ```
/// use clap::Parser;
/// use shellward::configuration::Args;
///
/// let args = Args::parse_from(["shellward", "--port", "9000"]);
/// let config = args.load().unwrap();
/// assert_eq!(config.port, 9000);
/// ```
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "shellward", version, about = "Secure command execution and terminal sessions")]
pub struct Args {
    /// Path to a TOML configuration file
    pub config: Option<PathBuf>,

    /// Address the HTTP interface binds to
    #[arg(long, env = "SHELLWARD_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port the HTTP interface listens on
    #[arg(long, env = "SHELLWARD_PORT")]
    pub port: Option<u16>,

    /// Directory holding the database, key file and trust store
    #[arg(long, env = "SHELLWARD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Data key file, used when SHELLWARD_ENCRYPTION_KEY is unset
    #[arg(long, env = "SHELLWARD_ENCRYPTION_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Upper bound for one execution, in seconds
    #[arg(long, env = "SHELLWARD_COMMAND_TIMEOUT_SECS")]
    pub command_timeout_secs: Option<u64>,

    /// Upper bound for one external vault call, in seconds
    #[arg(long, env = "SHELLWARD_VAULT_TIMEOUT_SECS")]
    pub vault_timeout_secs: Option<u64>,

    /// JSON-lines audit log. Auditing is off when unset
    #[arg(long, env = "SHELLWARD_AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Reject hosts that are not already in the trust store
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub strict_host_keys: bool,
}

impl Args {
    pub fn from_args() -> Self {
        Args::parse()
    }

    /// Reads the configuration file (if any), applies overrides and validates
    /// the result.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                debug!("Reading configuration from {}", path.display());
                let text = fs::read_to_string(path)?;
                toml::from_str::<Config>(&text).map_err(|e| ConfigError::TomlError(e.to_string()))?
            }
            None => Config::default(),
        };

        if let Some(v) = &self.bind_address {
            config.bind_address = v.clone();
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &self.key_file {
            config.key_file = Some(v.clone());
        }
        if let Some(v) = self.command_timeout_secs {
            config.command_timeout_secs = v;
        }
        if let Some(v) = self.vault_timeout_secs {
            config.vault_timeout_secs = v;
        }
        if let Some(v) = &self.audit_log {
            config.audit_log_path = Some(v.clone());
        }
        if self.strict_host_keys {
            config.strict_host_keys = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = 7000\ncommand_timeout_secs = 60").unwrap();

        let args = Args::try_parse_from([
            "shellward",
            file.path().to_str().unwrap(),
            "--port",
            "7100",
            "--strict-host-keys",
        ])
        .unwrap();
        let config = args.load().unwrap();

        assert_eq!(config.port, 7100);
        assert_eq!(config.command_timeout_secs, 60);
        assert!(config.strict_host_keys);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("SHELLWARD_COMMAND_TIMEOUT_SECS", "42");
        std::env::set_var("SHELLWARD_AUDIT_LOG", "/tmp/shellward-audit.jsonl");
        let parsed = Args::try_parse_from(["shellward"]);
        std::env::remove_var("SHELLWARD_COMMAND_TIMEOUT_SECS");
        std::env::remove_var("SHELLWARD_AUDIT_LOG");

        let config = parsed.unwrap().load().unwrap();
        assert_eq!(config.command_timeout_secs, 42);
        assert_eq!(
            config.audit_log_path,
            Some(PathBuf::from("/tmp/shellward-audit.jsonl"))
        );
    }

    #[test]
    #[serial]
    fn test_invalid_file_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = \"high\"").unwrap();
        let args = Args::try_parse_from(["shellward", file.path().to_str().unwrap()]).unwrap();
        assert!(matches!(args.load(), Err(ConfigError::TomlError(_))));
    }

    #[test]
    #[serial]
    fn test_zero_timeout_rejected() {
        let args = Args::try_parse_from(["shellward", "--command-timeout-secs", "0"]).unwrap();
        assert!(matches!(args.load(), Err(ConfigError::NotInRange(_))));
    }
}
