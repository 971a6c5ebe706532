use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::types::HostKey;
use crate::error_handling::types::TransportError;

/// A pinned host key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHost {
    /// `host:port`
    pub host: String,
    pub key_type: String,
    pub fingerprint: String,
    /// Base64 key blob, used to pin the key for the actual connection
    pub public_key: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownHostsFile {
    hosts: Vec<KnownHost>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// First contact, the key is now pinned
    Recorded,
    /// Key matches the pinned one
    Verified,
}

/// Host identity to key fingerprint, at most one per host.
///
/// Check, insert and persist run under one lock, so concurrent first
/// contacts with the same host are decided in order: the first key wins and
/// later ones are compared against it.
pub struct TrustStore {
    path: Option<PathBuf>,
    strict: bool,
    hosts: Mutex<HashMap<String, KnownHost>>,
}

impl TrustStore {
    pub fn load(path: &Path, strict: bool) -> Result<Self, TransportError> {
        let hosts = match std::fs::read_to_string(path) {
            Ok(text) => {
                let file: KnownHostsFile = serde_json::from_str(&text)
                    .map_err(|e| TransportError::TrustStore(e.to_string()))?;
                file.hosts
                    .into_iter()
                    .map(|h| (h.host.clone(), h))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(TransportError::IoError(e)),
        };
        info!(
            "Trust store {} loaded with {} hosts (strict: {})",
            path.display(),
            hosts.len(),
            strict
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            strict,
            hosts: Mutex::new(hosts),
        })
    }

    pub fn in_memory(strict: bool) -> Self {
        Self {
            path: None,
            strict,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn pinned(&self, identity: &str) -> Option<KnownHost> {
        self.hosts.lock().await.get(identity).cloned()
    }

    pub async fn verify_or_record(
        &self,
        identity: &str,
        presented: &HostKey,
    ) -> Result<TrustDecision, TransportError> {
        let fingerprint = presented.fingerprint();
        let mut hosts = self.hosts.lock().await;

        if let Some(known) = hosts.get(identity) {
            if known.key_type == presented.key_type() && known.fingerprint == fingerprint {
                return Ok(TrustDecision::Verified);
            }
            warn!(
                "Host key for {} changed: pinned {} {}, presented {} {}",
                identity,
                known.key_type,
                known.fingerprint,
                presented.key_type(),
                fingerprint
            );
            return Err(TransportError::HostKeyMismatch {
                host: identity.to_string(),
                expected: known.fingerprint.clone(),
                presented: fingerprint,
            });
        }

        if self.strict {
            warn!("Rejecting unknown host {} in strict mode", identity);
            return Err(TransportError::UnknownHost(identity.to_string()));
        }

        hosts.insert(
            identity.to_string(),
            KnownHost {
                host: identity.to_string(),
                key_type: presented.key_type().to_string(),
                fingerprint: fingerprint.clone(),
                public_key: presented.key_base64().to_string(),
                first_seen: Utc::now(),
            },
        );
        if let Err(e) = self.persist(&hosts).await {
            hosts.remove(identity);
            return Err(e);
        }
        info!("Pinned {} key {} for {}", presented.key_type(), fingerprint, identity);
        Ok(TrustDecision::Recorded)
    }

    async fn persist(&self, hosts: &HashMap<String, KnownHost>) -> Result<(), TransportError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut list: Vec<KnownHost> = hosts.values().cloned().collect();
        list.sort_by(|a, b| a.host.cmp(&b.host));
        let json = serde_json::to_vec_pretty(&KnownHostsFile { hosts: list })
            .map_err(|e| TransportError::TrustStore(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key(seed: &str) -> HostKey {
        HostKey::new("ssh-ed25519", &STANDARD.encode(seed.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn test_first_contact_pins_then_verifies() {
        let store = TrustStore::in_memory(false);
        assert_eq!(
            store.verify_or_record("h:22", &key("a")).await.unwrap(),
            TrustDecision::Recorded
        );
        assert_eq!(
            store.verify_or_record("h:22", &key("a")).await.unwrap(),
            TrustDecision::Verified
        );
        let err = store.verify_or_record("h:22", &key("b")).await.unwrap_err();
        assert!(matches!(err, TransportError::HostKeyMismatch { .. }));

        // the pinned key is unchanged by a rejected contact
        assert_eq!(store.pinned("h:22").await.unwrap().fingerprint, key("a").fingerprint());
    }

    #[tokio::test]
    async fn test_key_type_change_is_mismatch() {
        let store = TrustStore::in_memory(false);
        store.verify_or_record("h:22", &key("a")).await.unwrap();
        let rsa = HostKey::new("ssh-rsa", key("a").key_base64()).unwrap();
        assert!(matches!(
            store.verify_or_record("h:22", &rsa).await,
            Err(TransportError::HostKeyMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_ports_are_distinct_identities() {
        let store = TrustStore::in_memory(false);
        store.verify_or_record("h:22", &key("a")).await.unwrap();
        assert_eq!(
            store.verify_or_record("h:2222", &key("b")).await.unwrap(),
            TrustDecision::Recorded
        );
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_unknown() {
        let store = TrustStore::in_memory(true);
        assert!(matches!(
            store.verify_or_record("h:22", &key("a")).await,
            Err(TransportError::UnknownHost(_))
        ));
        assert!(store.pinned("h:22").await.is_none());
    }

    #[tokio::test]
    async fn test_persisted_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts.json");
        {
            let store = TrustStore::load(&path, false).unwrap();
            store.verify_or_record("h:22", &key("a")).await.unwrap();
        }
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let strict = TrustStore::load(&path, true).unwrap();
        assert_eq!(
            strict.verify_or_record("h:22", &key("a")).await.unwrap(),
            TrustDecision::Verified
        );
        assert!(strict.verify_or_record("h:22", &key("z")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_first_contacts_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TrustStore::load(&dir.path().join("kh.json"), false).unwrap());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .verify_or_record("race:22", &key(&format!("key-{}", i)))
                        .await
                })
            })
            .collect();

        let mut recorded = 0;
        let mut mismatched = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(TrustDecision::Recorded) => recorded += 1,
                Err(TransportError::HostKeyMismatch { .. }) => mismatched += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(mismatched, 15);

        let reloaded = TrustStore::load(&dir.path().join("kh.json"), false).unwrap();
        let winner = store.pinned("race:22").await.unwrap();
        assert_eq!(reloaded.pinned("race:22").await.unwrap(), winner);
    }
}
