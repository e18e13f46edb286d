//! Cryptex Core Library
//!
//! The secure core of a local-first, end-to-end-encrypted credential vault:
//! the vault envelope codec, the credential model and reconciliation engine,
//! the device-pairing protocol and challenge-response sign-in.

pub mod backup;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod platform;
pub mod session;
pub mod storage;
pub mod sync;
pub mod totp;
pub mod vault;

pub use config::CryptexConfig;
pub use credential::{calculate_totp, ContentHash, Credential, Totp, TotpCode};
pub use crypto::{
    decrypt, encrypt, Algorithm, CryptoError, EncryptedBlob, EnvelopeSettings, KdfConfig,
    KeyDerivationFunction,
};
pub use session::VaultSession;
pub use storage::{SqliteVaultStore, VaultStore};
pub use vault::{LinkedDevice, OnlineServicesAccount, Vault, VaultMetadata};

use thiserror::Error;
use uuid::Uuid;

/// Result type for Cryptex operations
pub type Result<T> = std::result::Result<T, CryptexError>;

/// General error type for Cryptex operations
#[derive(Error, Debug)]
pub enum CryptexError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Reconciliation expected a local credential that is no longer there.
    #[error("Consistency error: credential {id} changed during reconciliation")]
    Consistency { id: Uuid },

    #[error("Pairing cancelled")]
    PairingCancelled,

    #[error("Pairing timed out")]
    PairingTimeout,

    /// Deliberately carries no detail.
    #[error("unauthenticated")]
    RelayAuth,

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device registry error: {0}")]
    Registry(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration file error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptexError {
    /// Whether the operator can fix this by trying again with different input
    /// (wrong passphrase, wrong mnemonic, bad form input).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CryptexError::Crypto(CryptoError::Decryption) | CryptexError::InvalidInput(_)
        )
    }

    /// Whether this is the indistinguishable wrong-passphrase/corrupt-blob failure.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(self, CryptexError::Crypto(CryptoError::Decryption))
    }
}

impl From<rusqlite::Error> for CryptexError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
