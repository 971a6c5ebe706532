use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use log::trace;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::types::{DataKey, EncryptedBlob, NONCE_LEN, TAG_LEN};
use crate::error_handling::types::CryptoError;

/// Largest plaintext accepted by `encrypt`.
pub const MAX_PLAINTEXT_LEN: usize = 16 * 1024 * 1024;

/// Authenticated encryption under the single process-wide data key.
///
/// A service built with [`EncryptionService::unavailable`] answers every call
/// with `KeyUnavailable`. This is what runs when key generation had to be
/// aborted at startup.
pub struct EncryptionService {
    key: Option<DataKey>,
}

impl EncryptionService {
    pub fn new(key: DataKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn unavailable() -> Self {
        Self { key: None }
    }

    pub fn is_ready(&self) -> bool {
        self.key.is_some()
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CryptoError> {
        let key = self.key.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())))
    }

    /// Encrypts `plaintext` with a fresh random nonce. `aad` is authenticated
    /// but not stored.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CryptoError::PayloadTooLarge(plaintext.len()));
        }
        let cipher = self.cipher()?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
            .map_err(|_| CryptoError::PayloadTooLarge(plaintext.len()))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());
        trace!("Encrypted {} bytes", plaintext.len());

        Ok(EncryptedBlob {
            nonce,
            tag: tag_bytes,
            ciphertext: buffer,
        })
    }

    /// Any failure (wrong key, wrong `aad`, modified nonce/tag/ciphertext) is
    /// `AuthFailure`.
    pub fn decrypt(
        &self,
        blob: &EncryptedBlob,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher = self.cipher()?;
        let mut buffer = Zeroizing::new(blob.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&blob.nonce),
                aad,
                buffer.as_mut_slice(),
                Tag::from_slice(&blob.tag),
            )
            .map_err(|_| CryptoError::AuthFailure)?;
        Ok(buffer)
    }

    pub fn encrypt_str(&self, plaintext: &str, aad: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        self.encrypt(plaintext.as_bytes(), aad)
    }

    pub fn decrypt_string(
        &self,
        blob: &EncryptedBlob,
        aad: &[u8],
    ) -> Result<Zeroizing<String>, CryptoError> {
        let bytes = self.decrypt(blob, aad)?;
        match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(Zeroizing::new(text.to_owned())),
            Err(_) => Err(CryptoError::AuthFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::types::KEY_LEN;

    fn service(seed: u8) -> EncryptionService {
        EncryptionService::new(DataKey::from_bytes([seed; KEY_LEN]))
    }

    #[test]
    fn test_round_trip_various_sizes() {
        let svc = service(3);
        for len in [0usize, 1, 15, 16, 17, 255, 4096, 65_537] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let blob = svc.encrypt(&plaintext, b"secret/script/a").unwrap();
            let opened = svc.decrypt(&blob, b"secret/script/a").unwrap();
            assert_eq!(opened.as_slice(), plaintext.as_slice());
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let svc = service(3);
        let a = svc.encrypt(b"same", b"").unwrap();
        let b = svc.encrypt(b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_any_single_bit_flip_is_rejected() {
        let svc = service(5);
        let plaintext = b"ssh-ed25519 private key material".to_vec();
        let blob = svc.encrypt(&plaintext, b"aad").unwrap();

        for byte in 0..blob.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(matches!(
                    svc.decrypt(&tampered, b"aad"),
                    Err(CryptoError::AuthFailure)
                ));
            }
        }
        for byte in 0..TAG_LEN {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered.tag[byte] ^= 1 << bit;
                assert!(matches!(
                    svc.decrypt(&tampered, b"aad"),
                    Err(CryptoError::AuthFailure)
                ));
            }
        }
        for byte in 0..NONCE_LEN {
            let mut tampered = blob.clone();
            tampered.nonce[byte] ^= 0x80;
            assert!(svc.decrypt(&tampered, b"aad").is_err());
        }
    }

    #[test]
    fn test_wrong_key_and_wrong_aad_look_identical() {
        let blob = service(1).encrypt(b"payload", b"history/1/output").unwrap();

        let wrong_key = service(2).decrypt(&blob, b"history/1/output");
        let wrong_aad = service(1).decrypt(&blob, b"history/1/command");

        assert!(matches!(wrong_key, Err(CryptoError::AuthFailure)));
        assert!(matches!(wrong_aad, Err(CryptoError::AuthFailure)));
    }

    #[test]
    fn test_unavailable_service_refuses() {
        let svc = EncryptionService::unavailable();
        assert!(!svc.is_ready());
        assert!(matches!(
            svc.encrypt(b"x", b""),
            Err(CryptoError::KeyUnavailable)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let svc = service(1);
        let big = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            svc.encrypt(&big, b""),
            Err(CryptoError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_decrypt_string_rejects_non_utf8() {
        let svc = service(1);
        let blob = svc.encrypt(&[0xff, 0xfe], b"").unwrap();
        assert!(matches!(
            svc.decrypt_string(&blob, b""),
            Err(CryptoError::AuthFailure)
        ));
        let blob = svc.encrypt_str("uptime", b"").unwrap();
        assert_eq!(svc.decrypt_string(&blob, b"").unwrap().as_str(), "uptime");
    }
}
