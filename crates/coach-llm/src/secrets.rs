//! At-rest protection for stored provider keys.
//!
//! Sealed values are `enc:v1:` followed by base64(nonce ‖ ciphertext) under
//! ChaCha20-Poly1305. Values without the prefix are treated as legacy
//! plaintext and returned unchanged by [`CredentialCipher::open`].

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const SEALED_PREFIX: &str = "enc:v1:";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    Io(String),
}

#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher([REDACTED])")
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Cipher keyed from `path`, creating a fresh key file (mode 0600) if absent.
    pub fn from_key_file(path: &Path) -> Result<Self, SecretError> {
        load_or_create_key(path).map(Self::new)
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(combined)))
    }

    pub fn open(&self, value: &str) -> Result<String, SecretError> {
        let Some(encoded) = value.strip_prefix(SEALED_PREFIX) else {
            return Ok(value.to_string());
        };
        let combined = STANDARD
            .decode(encoded)
            .map_err(|_| SecretError::InvalidEncoding)?;
        if combined.len() < NONCE_LEN {
            return Err(SecretError::InvalidEncoding);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = ChaCha20Poly1305::new((&self.key).into())
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::InvalidUtf8)
    }
}

pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Load or create the secret key file.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], SecretError> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path).map_err(|e| SecretError::Io(e.to_string()))?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| SecretError::InvalidEncoding)?;
        return <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| SecretError::InvalidKeyLength);
    }

    let key = generate_key();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SecretError::Io(e.to_string()))?;
    }
    std::fs::write(path, STANDARD.encode(key)).map_err(|e| SecretError::Io(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| SecretError::Io(e.to_string()))?;
    }

    Ok(key)
}
