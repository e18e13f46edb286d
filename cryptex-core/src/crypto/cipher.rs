//! Authenticated encryption for envelope payloads.
//!
//! - XChaCha20-Poly1305: 256-bit key, 192-bit (24 byte) random nonce
//! - AES-256-GCM: 256-bit key, 96-bit (12 byte) random nonce
//!
//! Both append a 128-bit tag to the ciphertext. A fresh nonce is drawn for
//! every seal; the key is always freshly derived from a fresh salt, so nonce
//! reuse under one key does not occur in practice.

use crate::crypto::{CryptoError, Result, KEY_LEN};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// AEAD algorithm recorded in every blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "XChaCha20-Poly1305")]
    XChaCha20Poly1305,
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
}

impl Algorithm {
    pub fn nonce_len(self) -> usize {
        match self {
            Algorithm::XChaCha20Poly1305 => 24,
            Algorithm::Aes256Gcm => 12,
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::XChaCha20Poly1305
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::XChaCha20Poly1305 => write!(f, "XChaCha20-Poly1305"),
            Algorithm::Aes256Gcm => write!(f, "AES-256-GCM"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = CryptoError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xchacha20-poly1305" | "xchacha20poly1305" | "xchacha" => {
                Ok(Algorithm::XChaCha20Poly1305)
            }
            "aes-256-gcm" | "aes256gcm" | "aes" => Ok(Algorithm::Aes256Gcm),
            other => Err(CryptoError::Configuration(format!(
                "Unsupported algorithm '{}'. Use 'xchacha20-poly1305' or 'aes-256-gcm'.",
                other
            ))),
        }
    }
}

/// Encrypt `plaintext`, returning `(nonce, ciphertext || tag)`.
pub fn seal(
    algorithm: Algorithm,
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    match algorithm {
        Algorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(key.into());
            let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, plaintext)
                .map_err(|e| CryptoError::Encryption(format!("{}", e)))?;
            Ok((nonce.to_vec(), ciphertext))
        }
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(key.into());
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, plaintext)
                .map_err(|e| CryptoError::Encryption(format!("{}", e)))?;
            Ok((nonce.to_vec(), ciphertext))
        }
    }
}

/// Verify and decrypt `ciphertext || tag`.
///
/// Every failure, including a nonce of the wrong length, is reported as
/// [`CryptoError::Decryption`].
pub fn open(
    algorithm: Algorithm,
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != algorithm.nonce_len() {
        return Err(CryptoError::Decryption);
    }

    match algorithm {
        Algorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(key.into());
            cipher
                .decrypt(chacha20poly1305::XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decryption)
        }
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(key.into());
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decryption)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    const ALGORITHMS: [Algorithm; 2] = [Algorithm::XChaCha20Poly1305, Algorithm::Aes256Gcm];

    #[test]
    fn test_seal_open_roundtrip() {
        for algorithm in ALGORITHMS {
            let key: [u8; 32] = random_bytes();
            let (nonce, ciphertext) = seal(algorithm, &key, b"Hello, vault!").unwrap();
            assert_eq!(nonce.len(), algorithm.nonce_len());
            assert_eq!(ciphertext.len(), b"Hello, vault!".len() + 16);

            let plaintext = open(algorithm, &key, &nonce, &ciphertext).unwrap();
            assert_eq!(plaintext, b"Hello, vault!");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        for algorithm in ALGORITHMS {
            let key1: [u8; 32] = random_bytes();
            let key2: [u8; 32] = random_bytes();
            let (nonce, ciphertext) = seal(algorithm, &key1, b"Secret data").unwrap();
            assert_eq!(
                open(algorithm, &key2, &nonce, &ciphertext),
                Err(CryptoError::Decryption)
            );
        }
    }

    #[test]
    fn test_tampering_detected() {
        for algorithm in ALGORITHMS {
            let key: [u8; 32] = random_bytes();
            let (nonce, mut ciphertext) = seal(algorithm, &key, b"Original data").unwrap();
            ciphertext[0] ^= 0xFF;
            assert!(open(algorithm, &key, &nonce, &ciphertext).is_err());
        }
    }

    #[test]
    fn test_nonce_length_mismatch_is_decryption_error() {
        let key: [u8; 32] = random_bytes();
        let (nonce, ciphertext) = seal(Algorithm::XChaCha20Poly1305, &key, b"data").unwrap();
        // A 24-byte nonce presented as AES-GCM must not panic.
        assert_eq!(
            open(Algorithm::Aes256Gcm, &key, &nonce, &ciphertext),
            Err(CryptoError::Decryption)
        );
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            "AES-256-GCM".parse::<Algorithm>().unwrap(),
            Algorithm::Aes256Gcm
        );
        assert_eq!(
            Algorithm::XChaCha20Poly1305.to_string(),
            "XChaCha20-Poly1305"
        );
        assert!("des".parse::<Algorithm>().is_err());
    }
}
