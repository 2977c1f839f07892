use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use tether_core::errors::SyncError;

const NONCE_LEN: usize = 12;

/// Payload encryption boundary. Everything past this point is opaque
/// bytes; the engine never inspects plaintext after encryption nor
/// ciphertext before decryption.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError>;
    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, SyncError>;
}

/// ChaCha20-Poly1305 AEAD. Each payload carries its random 12-byte nonce
/// as a prefix.
pub struct ChaChaEncryptor {
    cipher: ChaCha20Poly1305,
}

impl ChaChaEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    pub fn from_key_file(path: &Path) -> Result<Self, KeyError> {
        Ok(Self::new(&load_or_create_key(path)?))
    }
}

impl Encryptor for ChaChaEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SyncError::EncryptionFailure("encrypt failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, SyncError> {
        if payload.len() < NONCE_LEN {
            return Err(SyncError::EncryptionFailure(
                "payload shorter than nonce".into(),
            ));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                SyncError::EncryptionFailure("decrypt failed: wrong key or tampered payload".into())
            })
    }
}

/// Identity encryptor for tests.
pub struct PlainEncryptor;

impl Encryptor for PlainEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, SyncError> {
        Ok(payload.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key encoding")]
    InvalidEncoding,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    IoError(String),
}

/// Generate a random 256-bit key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Load the key file, creating it with fresh material on first run.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], KeyError> {
    if path.exists() {
        let encoded =
            std::fs::read_to_string(path).map_err(|e| KeyError::IoError(e.to_string()))?;
        let bytes =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded.trim())
                .map_err(|_| KeyError::InvalidEncoding)?;
        if bytes.len() != 32 {
            return Err(KeyError::InvalidKeyLength);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KeyError::IoError(e.to_string()))?;
        }
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
        std::fs::write(path, &encoded).map_err(|e| KeyError::IoError(e.to_string()))?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| KeyError::IoError(e.to_string()))?;
        }

        Ok(key)
    }
}
