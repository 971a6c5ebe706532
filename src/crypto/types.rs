use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error_handling::types::CryptoError;

/// ChaCha20-Poly1305 key length (256-bit)
pub const KEY_LEN: usize = 32;
/// Random nonce drawn for every encryption (96-bit)
pub const NONCE_LEN: usize = 12;
/// Poly1305 authentication tag (128-bit)
pub const TAG_LEN: usize = 16;
/// Leading byte of the encoded blob layout
pub const BLOB_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

/// The process-wide data key. Wiped from memory when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// At-rest ciphertext.
///
/// The associated data is not stored in the blob; callers rebuild it from the
/// identity of the record the blob belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// `version || nonce || tag || ciphertext`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        out.push(BLOB_VERSION);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Malformed input is reported as `AuthFailure`, like any other decrypt
    /// failure.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < HEADER_LEN || bytes[0] != BLOB_VERSION {
            return Err(CryptoError::AuthFailure);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[1..1 + NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[1 + NONCE_LEN..HEADER_LEN]);
        Ok(Self {
            nonce,
            tag,
            ciphertext: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl Serialize for EncryptedBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.encode()))
    }
}

impl<'de> Deserialize<'de> for EncryptedBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)?;
        EncryptedBlob::decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedBlob {
        EncryptedBlob {
            nonce: [7u8; NONCE_LEN],
            tag: [9u8; TAG_LEN],
            ciphertext: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_encode_layout() {
        let encoded = sample().encode();
        assert_eq!(encoded.len(), HEADER_LEN + 4);
        assert_eq!(encoded[0], BLOB_VERSION);
        assert_eq!(&encoded[1..13], &[7u8; NONCE_LEN]);
        assert_eq!(&encoded[13..29], &[9u8; TAG_LEN]);
        assert_eq!(EncryptedBlob::decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            EncryptedBlob::decode(&[BLOB_VERSION, 1, 2]),
            Err(CryptoError::AuthFailure)
        ));
        let mut encoded = sample().encode();
        encoded[0] = 42;
        assert!(matches!(
            EncryptedBlob::decode(&encoded),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn test_data_key_length_checked() {
        assert!(DataKey::from_slice(&[0u8; 16]).is_err());
        assert!(DataKey::from_slice(&[0u8; KEY_LEN]).is_ok());
        assert_eq!(format!("{:?}", DataKey::from_bytes([1u8; KEY_LEN])), "DataKey(..)");
    }
}
