//! Cryptographic primitives for the vault envelope.
//!
//! This module provides:
//! - Argon2id and PBKDF2-HMAC-SHA256 key derivation with bounded parameters
//! - XChaCha20-Poly1305 and AES-256-GCM authenticated encryption
//! - The portable `EncryptedBlob` envelope and its JSON form
//! - One-time mnemonic passphrases for pairing transfers

pub mod cipher;
pub mod envelope;
pub mod kdf;
pub mod mnemonic;

pub use cipher::Algorithm;
pub use envelope::{
    decrypt, decrypt_async, encrypt, encrypt_async, reencrypt, EncryptedBlob, EnvelopeSettings,
};
pub use kdf::{derive_key, KdfConfig, KeyDerivationFunction};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// KDF parameters outside their declared bounds. Raised before any
    /// key derivation or cipher work happens.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Wrong passphrase, corrupted ciphertext or tag mismatch.
    #[error("Decryption failed")]
    Decryption,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Length of every symmetric key derived or used by the envelope.
pub const KEY_LEN: usize = 32;

/// Length of the random salt stored next to every ciphertext.
pub const SALT_LEN: usize = 16;

/// Fill a fixed-size array from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
