use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{info, warn};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::types::{DataKey, KEY_LEN};
use crate::error_handling::types::CryptoError;

/// Base64 data key, takes precedence over the key file
pub const KEY_ENV: &str = "SHELLWARD_ENCRYPTION_KEY";

/// Minimum seeded entropy (bits) required before generating a key
const MIN_ENTROPY_BITS: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Environment,
    File(PathBuf),
    Generated(PathBuf),
}

/// Loads the data key from `SHELLWARD_ENCRYPTION_KEY`, then from `key_file`,
/// and otherwise generates and persists a new one.
pub fn load_data_key(key_file: &Path) -> Result<(DataKey, KeySource), CryptoError> {
    let env_value = std::env::var(KEY_ENV).ok().map(Zeroizing::new);
    load_data_key_from(env_value.as_deref().map(String::as_str), key_file)
}

pub fn load_data_key_from(
    env_value: Option<&str>,
    key_file: &Path,
) -> Result<(DataKey, KeySource), CryptoError> {
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        let key = decode_key(value)?;
        info!("Data key loaded from environment");
        return Ok((key, KeySource::Environment));
    }

    if key_file.exists() {
        check_owner_only(key_file)?;
        let contents = Zeroizing::new(fs::read_to_string(key_file)?);
        let key = decode_key(&contents)?;
        info!("Data key loaded from {}", key_file.display());
        return Ok((key, KeySource::File(key_file.to_path_buf())));
    }

    if !entropy_pool_seeded() {
        warn!("Could not verify the OS entropy pool is seeded, refusing to generate a data key");
        return Err(CryptoError::EntropyUnverified);
    }

    let key = generate_and_persist(key_file)?;
    info!("Generated new data key at {}", key_file.display());
    Ok((key, KeySource::Generated(key_file.to_path_buf())))
}

fn decode_key(encoded: &str) -> Result<DataKey, CryptoError> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|_| CryptoError::InvalidKey("not valid base64".to_string()))?,
    );
    DataKey::from_slice(&raw)
}

fn check_owner_only(path: &Path) -> Result<(), CryptoError> {
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(CryptoError::KeyFileInsecure(format!(
            "{} has mode {:o}",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

fn generate_and_persist(path: &Path) -> Result<DataKey, CryptoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut raw = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut raw[..]);
    let encoded = Zeroizing::new(STANDARD.encode(&raw[..]));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(encoded.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;

    Ok(DataKey::from_bytes(*raw))
}

#[cfg(target_os = "linux")]
fn entropy_pool_seeded() -> bool {
    match fs::read_to_string("/proc/sys/kernel/random/entropy_avail") {
        Ok(text) => match text.trim().parse::<u32>() {
            Ok(bits) => bits >= MIN_ENTROPY_BITS,
            Err(e) => {
                warn!("Unreadable entropy_avail value: {}", e);
                false
            }
        },
        Err(e) => {
            warn!("Cannot read entropy_avail: {}", e);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn entropy_pool_seeded() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn encoded_key(byte: u8) -> String {
        STANDARD.encode([byte; KEY_LEN])
    }

    #[test]
    fn test_environment_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.key");
        fs::write(&path, encoded_key(1)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        let env = encoded_key(2);
        let (key, source) = load_data_key_from(Some(&env), &path).unwrap();
        assert_eq!(source, KeySource::Environment);
        assert_eq!(key.as_bytes(), &[2u8; KEY_LEN]);
    }

    #[test]
    fn test_key_file_must_be_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.key");
        fs::write(&path, encoded_key(1)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let result = load_data_key_from(None, &path);
        assert!(matches!(result, Err(CryptoError::KeyFileInsecure(_))));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let (key, source) = load_data_key_from(None, &path).unwrap();
        assert_eq!(source, KeySource::File(path.clone()));
        assert_eq!(key.as_bytes(), &[1u8; KEY_LEN]);
    }

    #[test]
    fn test_bad_key_material_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unused.key");
        assert!(matches!(
            load_data_key_from(Some("%%%"), &path),
            Err(CryptoError::InvalidKey(_))
        ));
        let short = STANDARD.encode([0u8; 8]);
        assert!(matches!(
            load_data_key_from(Some(&short), &path),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_generated_key_is_persisted_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.key");

        match load_data_key_from(None, &path) {
            Ok((first, source)) => {
                assert_eq!(source, KeySource::Generated(path.clone()));
                let mode = fs::metadata(&path).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o600);

                let (second, source) = load_data_key_from(None, &path).unwrap();
                assert_eq!(source, KeySource::File(path.clone()));
                assert_eq!(first.as_bytes(), second.as_bytes());
            }
            // Sandboxes without a readable entropy counter abort generation.
            Err(CryptoError::EntropyUnverified) => assert!(!path.exists()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    #[serial]
    fn test_load_reads_process_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.key");
        std::env::set_var(KEY_ENV, encoded_key(9));
        let loaded = load_data_key(&path);
        std::env::remove_var(KEY_ENV);

        let (key, source) = loaded.unwrap();
        assert_eq!(source, KeySource::Environment);
        assert_eq!(key.as_bytes(), &[9u8; KEY_LEN]);
    }
}
