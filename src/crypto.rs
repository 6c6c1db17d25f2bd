//! Token encryption module using AES-256-GCM
//!
//! Secrets are encrypted under a subkey derived from the master key for one
//! specific context (a connection, or a connector version) and the same context
//! is bound in as additional authenticated data. Ciphertext lifted from one
//! connection's row therefore fails to decrypt in any other connection.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Derives a 32-byte subkey bound to `context` (HMAC-SHA256 over the master key).
    pub fn derive(&self, context: &[u8]) -> Result<CryptoKey, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        mac.update(b"authproxy/v1/");
        mac.update(context);
        CryptoKey::new(mac.finalize().into_bytes().to_vec())
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // version || nonce || ciphertext+tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM. Unversioned payloads are rejected.
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if !is_encrypted_payload(ciphertext) {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

/// Encryption capability scoped to an explicit key context.
pub trait EncryptService: Send + Sync {
    fn encrypt_for_connection(
        &self,
        connection_id: Uuid,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_for_connection(
        &self,
        connection_id: Uuid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn encrypt_for_connector_version(
        &self,
        connector_id: Uuid,
        version: i64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_for_connector_version(
        &self,
        connector_id: Uuid,
        version: i64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Convenience for token material, which is always UTF-8.
    fn decrypt_string_for_connection(
        &self,
        connection_id: Uuid,
        ciphertext: &[u8],
    ) -> Result<String, CryptoError> {
        let bytes = self.decrypt_for_connection(connection_id, ciphertext)?;
        String::from_utf8(bytes)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    }
}

/// AES-256-GCM implementation keyed from a single master key.
#[derive(Debug, Clone)]
pub struct AesGcmEncryptService {
    master: CryptoKey,
}

impl AesGcmEncryptService {
    pub fn new(master: CryptoKey) -> Self {
        Self { master }
    }

    fn seal(&self, context: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.master.derive(context.as_bytes())?;
        encrypt_bytes(&key, context.as_bytes(), plaintext)
    }

    fn open(&self, context: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.master.derive(context.as_bytes())?;
        decrypt_bytes(&key, context.as_bytes(), ciphertext)
    }
}

fn connection_context(connection_id: Uuid) -> String {
    format!("connection:{}", connection_id)
}

fn connector_version_context(connector_id: Uuid, version: i64) -> String {
    format!("connector-version:{}:{}", connector_id, version)
}

impl EncryptService for AesGcmEncryptService {
    fn encrypt_for_connection(
        &self,
        connection_id: Uuid,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.seal(&connection_context(connection_id), plaintext)
    }

    fn decrypt_for_connection(
        &self,
        connection_id: Uuid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.open(&connection_context(connection_id), ciphertext)
    }

    fn encrypt_for_connector_version(
        &self,
        connector_id: Uuid,
        version: i64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.seal(&connector_version_context(connector_id, version), plaintext)
    }

    fn decrypt_for_connector_version(
        &self,
        connector_id: Uuid,
        version: i64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.open(&connector_version_context(connector_id, version), ciphertext)
    }
}
