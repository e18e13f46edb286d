//! Passphrase key derivation for the vault envelope.
//!
//! Two functions are supported:
//! - Argon2id (memory cost in MiB, pass count), parallelism fixed at 1
//! - PBKDF2-HMAC-SHA256 (iteration count)
//!
//! Both produce a 32-byte key. Parameters are bounded so that a hostile or
//! corrupted blob cannot request a pathological derivation.

use crate::crypto::{CryptoError, Result, KEY_LEN};
use argon2::{Algorithm as Argon2Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

pub const ARGON2_MIN_MEM_MIB: u32 = 8;
pub const ARGON2_MAX_MEM_MIB: u32 = 4096;
pub const ARGON2_MIN_OPS: u32 = 1;
pub const ARGON2_MAX_OPS: u32 = 16;
pub const PBKDF2_MIN_ITERATIONS: u32 = 1;
pub const PBKDF2_MAX_ITERATIONS: u32 = 10_000_000;

/// Identifies a key derivation function in persisted blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyDerivationFunction {
    #[serde(rename = "Argon2id")]
    Argon2id,
    #[serde(rename = "PBKDF2")]
    Pbkdf2,
}

impl fmt::Display for KeyDerivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyDerivationFunction::Argon2id => write!(f, "Argon2id"),
            KeyDerivationFunction::Pbkdf2 => write!(f, "PBKDF2"),
        }
    }
}

impl FromStr for KeyDerivationFunction {
    type Err = CryptoError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "argon2id" | "argon2" => Ok(KeyDerivationFunction::Argon2id),
            "pbkdf2" | "pbkdf2-sha256" => Ok(KeyDerivationFunction::Pbkdf2),
            other => Err(CryptoError::Configuration(format!(
                "Unsupported key derivation function '{}'. Use 'argon2id' or 'pbkdf2'.",
                other
            ))),
        }
    }
}

/// Cost parameters for a key derivation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdfConfig {
    Argon2id { mem_limit_mib: u32, ops_limit: u32 },
    Pbkdf2 { iterations: u32 },
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self::argon2id_default()
    }
}

impl KdfConfig {
    /// 64 MiB, 3 passes.
    pub fn argon2id_default() -> Self {
        KdfConfig::Argon2id {
            mem_limit_mib: 64,
            ops_limit: 3,
        }
    }

    /// 600k iterations, the OWASP 2023 figure for HMAC-SHA256.
    pub fn pbkdf2_default() -> Self {
        KdfConfig::Pbkdf2 {
            iterations: 600_000,
        }
    }

    /// The cheapest Argon2id setting the bounds allow.
    pub fn argon2id_minimum() -> Self {
        KdfConfig::Argon2id {
            mem_limit_mib: ARGON2_MIN_MEM_MIB,
            ops_limit: ARGON2_MIN_OPS,
        }
    }

    pub fn default_for(function: KeyDerivationFunction) -> Self {
        match function {
            KeyDerivationFunction::Argon2id => Self::argon2id_default(),
            KeyDerivationFunction::Pbkdf2 => Self::pbkdf2_default(),
        }
    }

    pub fn function(&self) -> KeyDerivationFunction {
        match self {
            KdfConfig::Argon2id { .. } => KeyDerivationFunction::Argon2id,
            KdfConfig::Pbkdf2 { .. } => KeyDerivationFunction::Pbkdf2,
        }
    }

    /// Verify that parameters are within their declared bounds
    pub fn validate(&self) -> Result<()> {
        match *self {
            KdfConfig::Argon2id {
                mem_limit_mib,
                ops_limit,
            } => {
                if !(ARGON2_MIN_MEM_MIB..=ARGON2_MAX_MEM_MIB).contains(&mem_limit_mib) {
                    return Err(CryptoError::Configuration(format!(
                        "Argon2id memory limit {} MiB outside [{}, {}]",
                        mem_limit_mib, ARGON2_MIN_MEM_MIB, ARGON2_MAX_MEM_MIB
                    )));
                }
                if !(ARGON2_MIN_OPS..=ARGON2_MAX_OPS).contains(&ops_limit) {
                    return Err(CryptoError::Configuration(format!(
                        "Argon2id ops limit {} outside [{}, {}]",
                        ops_limit, ARGON2_MIN_OPS, ARGON2_MAX_OPS
                    )));
                }
            }
            KdfConfig::Pbkdf2 { iterations } => {
                if !(PBKDF2_MIN_ITERATIONS..=PBKDF2_MAX_ITERATIONS).contains(&iterations) {
                    return Err(CryptoError::Configuration(format!(
                        "PBKDF2 iteration count {} outside [{}, {}]",
                        iterations, PBKDF2_MIN_ITERATIONS, PBKDF2_MAX_ITERATIONS
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Derive a symmetric key from a passphrase.
///
/// The same passphrase, config and salt always yield the same key.
pub fn derive_key(
    passphrase: &[u8],
    config: &KdfConfig,
    salt: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    config.validate()?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    match *config {
        KdfConfig::Argon2id {
            mem_limit_mib,
            ops_limit,
        } => {
            let params = Params::new(mem_limit_mib * 1024, ops_limit, 1, Some(KEY_LEN)).map_err(
                |e| CryptoError::Configuration(format!("Invalid Argon2id parameters: {}", e)),
            )?;
            Argon2::new(Argon2Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(passphrase, salt, &mut key[..])
                .map_err(|e| {
                    CryptoError::Configuration(format!("Argon2id derivation failed: {}", e))
                })?;
        }
        KdfConfig::Pbkdf2 { iterations } => {
            pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut key[..]);
        }
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8; 16] = b"0123456789abcdef";

    #[test]
    fn test_defaults_are_within_bounds() {
        assert!(KdfConfig::argon2id_default().validate().is_ok());
        assert!(KdfConfig::pbkdf2_default().validate().is_ok());
        assert!(KdfConfig::argon2id_minimum().validate().is_ok());
    }

    #[test]
    fn test_bounds_rejected() {
        let too_little_memory = KdfConfig::Argon2id {
            mem_limit_mib: 1,
            ops_limit: 3,
        };
        assert!(matches!(
            too_little_memory.validate(),
            Err(CryptoError::Configuration(_))
        ));

        let too_many_passes = KdfConfig::Argon2id {
            mem_limit_mib: 64,
            ops_limit: 1000,
        };
        assert!(too_many_passes.validate().is_err());

        let zero_iterations = KdfConfig::Pbkdf2 { iterations: 0 };
        assert!(matches!(
            derive_key(b"pw", &zero_iterations, SALT),
            Err(CryptoError::Configuration(_))
        ));
    }

    #[test]
    fn test_argon2id_deterministic() {
        let config = KdfConfig::argon2id_minimum();
        let key1 = derive_key(b"correct horse", &config, SALT).unwrap();
        let key2 = derive_key(b"correct horse", &config, SALT).unwrap();
        assert_eq!(*key1, *key2);

        let key3 = derive_key(b"battery staple", &config, SALT).unwrap();
        assert_ne!(*key1, *key3);

        let key4 = derive_key(b"correct horse", &config, b"fedcba9876543210").unwrap();
        assert_ne!(*key1, *key4);
    }

    #[test]
    fn test_pbkdf2_known_vector() {
        let key = derive_key(b"password", &KdfConfig::Pbkdf2 { iterations: 1 }, b"salt").unwrap();
        assert_eq!(
            hex::encode(*key),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn test_function_names() {
        assert_eq!(
            "argon2id".parse::<KeyDerivationFunction>().unwrap(),
            KeyDerivationFunction::Argon2id
        );
        assert_eq!(
            "PBKDF2".parse::<KeyDerivationFunction>().unwrap(),
            KeyDerivationFunction::Pbkdf2
        );
        assert!("scrypt".parse::<KeyDerivationFunction>().is_err());
        assert_eq!(
            KdfConfig::pbkdf2_default().function(),
            KeyDerivationFunction::Pbkdf2
        );
    }
}
