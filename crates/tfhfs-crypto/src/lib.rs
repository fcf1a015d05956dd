//! Crypto envelope sitting between the storage layer and a raw block
//! backend. The storage layer is unaware of encryption; it only ever
//! sees plaintext block data and a [`BlockStatus`], and calls into an
//! envelope to turn that pair into the ciphertext a backend actually
//! stores, and back again.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use thiserror::Error;
use tfhfs_block::BlockStatus;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("wrong password or corrupt ciphertext")]
    WrongPassword,
    #[error("ciphertext is too short to contain a nonce and status byte")]
    Corrupt,
}

/// An invertible `(plaintext, status) <-> ciphertext` transform, keyed
/// by a password and salt. Integrity is authenticated: decrypting with
/// the wrong key fails loudly instead of returning garbage.
pub trait CryptoEnvelope: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], status: BlockStatus) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, BlockStatus), CryptoError>;
}

const NONCE_LEN: usize = 12;

fn status_to_byte(status: BlockStatus) -> u8 {
    match status {
        BlockStatus::Normal => 0,
        BlockStatus::WantSave => 1,
        BlockStatus::WantDelete => 2,
        BlockStatus::WantSaveWeak => 3,
        BlockStatus::Missing => 4,
        BlockStatus::Weak => 5,
    }
}

fn byte_to_status(byte: u8) -> Result<BlockStatus, CryptoError> {
    match byte {
        0 => Ok(BlockStatus::Normal),
        1 => Ok(BlockStatus::WantSave),
        2 => Ok(BlockStatus::WantDelete),
        3 => Ok(BlockStatus::WantSaveWeak),
        4 => Ok(BlockStatus::Missing),
        5 => Ok(BlockStatus::Weak),
        _ => Err(CryptoError::Corrupt),
    }
}

/// AES-256-GCM envelope keyed by `argon2id(password, salt)`.
pub struct AesGcmEnvelope {
    cipher: Aes256Gcm,
}

impl AesGcmEnvelope {
    pub fn new(password: &[u8], salt: &[u8]) -> Self {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(password, salt, &mut key)
            .expect("argon2 key derivation with a valid salt length");
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        Self { cipher }
    }

    /// Generate a fresh random salt for a brand-new store.
    pub fn generate_salt() -> [u8; 16] {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}

impl CryptoEnvelope for AesGcmEnvelope {
    fn encrypt(&self, plaintext: &[u8], status: BlockStatus) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut payload = Vec::with_capacity(plaintext.len() + 1);
        payload.push(status_to_byte(status));
        payload.extend_from_slice(plaintext);

        let sealed = self
            .cipher
            .encrypt(nonce, payload.as_slice())
            .expect("AES-GCM encryption of a bounded in-memory payload");

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        out
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, BlockStatus), CryptoError> {
        if ciphertext.len() < NONCE_LEN + 1 {
            return Err(CryptoError::Corrupt);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let payload = self
            .cipher
            .decrypt(nonce, sealed)
            .map_err(|_| CryptoError::WrongPassword)?;

        let (status_byte, plaintext) = payload.split_first().ok_or(CryptoError::Corrupt)?;
        let status = byte_to_status(*status_byte)?;
        Ok((plaintext.to_vec(), status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext_and_status() {
        let salt = AesGcmEnvelope::generate_salt();
        let envelope = AesGcmEnvelope::new(b"correct horse", &salt);

        let ciphertext = envelope.encrypt(b"tree node bytes", BlockStatus::WantSave);
        let (plaintext, status) = envelope.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext, b"tree node bytes");
        assert_eq!(status, BlockStatus::WantSave);
    }

    #[test]
    fn wrong_password_fails_closed() {
        let salt = AesGcmEnvelope::generate_salt();
        let envelope = AesGcmEnvelope::new(b"correct horse", &salt);
        let wrong = AesGcmEnvelope::new(b"incorrect horse", &salt);

        let ciphertext = envelope.encrypt(b"secret", BlockStatus::Normal);
        assert!(matches!(wrong.decrypt(&ciphertext), Err(CryptoError::WrongPassword)));
    }

    #[test]
    fn truncated_ciphertext_is_corrupt() {
        let salt = AesGcmEnvelope::generate_salt();
        let envelope = AesGcmEnvelope::new(b"pw", &salt);
        assert!(matches!(envelope.decrypt(&[1, 2, 3]), Err(CryptoError::Corrupt)));
    }
}
