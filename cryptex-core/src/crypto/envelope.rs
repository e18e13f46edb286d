//! The portable encrypted envelope.
//!
//! An [`EncryptedBlob`] records everything needed to re-derive its key and
//! decrypt it except the passphrase: algorithm, KDF, KDF cost, salt and
//! nonce. Decryption always uses the recorded values, never the caller's
//! current defaults, so blobs written under older defaults keep opening.
//!
//! JSON form (field names are a compatibility contract):
//!
//! ```text
//! {
//!   "version": 1,
//!   "algorithm": "XChaCha20-Poly1305",
//!   "keyDerivationFunction": "Argon2id",
//!   "kdfConfig": { "memLimitMiB": 64, "opsLimit": 3 },
//!   "salt": "<base64>",
//!   "nonce": "<base64>",
//!   "ciphertext": "<base64>"
//! }
//! ```

use crate::crypto::cipher::{self, Algorithm};
use crate::crypto::kdf::{derive_key, KdfConfig, KeyDerivationFunction};
use crate::crypto::{random_bytes, CryptoError, Result, SALT_LEN};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Current blob format version.
pub const BLOB_VERSION: u32 = 1;

/// Algorithm and KDF choice used when sealing a new blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeSettings {
    pub algorithm: Algorithm,
    pub kdf: KdfConfig,
}

impl EnvelopeSettings {
    pub fn new(algorithm: Algorithm, kdf: KdfConfig) -> Self {
        Self { algorithm, kdf }
    }

    /// Settings for full vault payloads.
    pub fn vault_default() -> Self {
        Self::new(Algorithm::XChaCha20Poly1305, KdfConfig::argon2id_default())
    }

    /// Settings for pairing transfers. The mnemonic carries full entropy, so
    /// the KDF only needs its minimum cost.
    pub fn mnemonic() -> Self {
        Self::new(Algorithm::XChaCha20Poly1305, KdfConfig::argon2id_minimum())
    }

    pub fn validate(&self) -> Result<()> {
        self.kdf.validate()
    }
}

/// Portable ciphertext container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BlobRecord", into = "BlobRecord")]
pub struct EncryptedBlob {
    pub version: u32,
    pub algorithm: Algorithm,
    pub kdf: KdfConfig,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn key_derivation_function(&self) -> KeyDerivationFunction {
        self.kdf.function()
    }

    pub fn settings(&self) -> EnvelopeSettings {
        EnvelopeSettings::new(self.algorithm, self.kdf)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

/// Encrypt `payload` under a key derived from `passphrase`.
///
/// Fails with [`CryptoError::Configuration`] before any crypto runs when the
/// KDF parameters are out of bounds.
pub fn encrypt(
    payload: &[u8],
    passphrase: &str,
    settings: &EnvelopeSettings,
) -> Result<EncryptedBlob> {
    settings.validate()?;

    let salt: [u8; SALT_LEN] = random_bytes();
    let key = derive_key(passphrase.as_bytes(), &settings.kdf, &salt)?;
    let (nonce, ciphertext) = cipher::seal(settings.algorithm, &key, payload)?;

    Ok(EncryptedBlob {
        version: BLOB_VERSION,
        algorithm: settings.algorithm,
        kdf: settings.kdf,
        salt: salt.to_vec(),
        nonce,
        ciphertext,
    })
}

/// Decrypt a blob with the parameters recorded inside it.
///
/// Wrong passphrase, tampering and malformed parameters all surface as the
/// same [`CryptoError::Decryption`].
pub fn decrypt(blob: &EncryptedBlob, passphrase: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key = derive_key(passphrase.as_bytes(), &blob.kdf, &blob.salt)
        .map_err(|_| CryptoError::Decryption)?;
    let plaintext = cipher::open(blob.algorithm, &key, &blob.nonce, &blob.ciphertext)?;
    Ok(Zeroizing::new(plaintext))
}

/// Re-encrypt under new settings. The input blob is left untouched.
pub fn reencrypt(
    blob: &EncryptedBlob,
    passphrase: &str,
    settings: &EnvelopeSettings,
) -> Result<EncryptedBlob> {
    settings.validate()?;
    let plaintext = decrypt(blob, passphrase)?;
    encrypt(&plaintext, passphrase, settings)
}

/// [`encrypt`] on the blocking pool.
///
/// Dropping the returned future abandons the result; the derivation itself
/// runs to completion in the background.
pub async fn encrypt_async(
    payload: Vec<u8>,
    passphrase: Zeroizing<String>,
    settings: EnvelopeSettings,
) -> Result<EncryptedBlob> {
    let payload = Zeroizing::new(payload);
    tokio::task::spawn_blocking(move || encrypt(&payload, &passphrase, &settings))
        .await
        .map_err(|e| CryptoError::Encryption(format!("KDF task failed: {}", e)))?
}

/// [`decrypt`] on the blocking pool.
pub async fn decrypt_async(
    blob: EncryptedBlob,
    passphrase: Zeroizing<String>,
) -> Result<Zeroizing<Vec<u8>>> {
    tokio::task::spawn_blocking(move || decrypt(&blob, &passphrase))
        .await
        .map_err(|_| CryptoError::Decryption)?
}

/// Serialized shape of [`EncryptedBlob`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobRecord {
    #[serde(default = "default_version")]
    version: u32,
    algorithm: Algorithm,
    key_derivation_function: KeyDerivationFunction,
    kdf_config: KdfConfigRecord,
    salt: String,
    #[serde(alias = "iv")]
    nonce: String,
    ciphertext: String,
}

fn default_version() -> u32 {
    BLOB_VERSION
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum KdfConfigRecord {
    #[serde(rename_all = "camelCase")]
    Argon2id {
        #[serde(rename = "memLimitMiB")]
        mem_limit_mib: u32,
        ops_limit: u32,
    },
    Pbkdf2 { iterations: u32 },
}

impl From<EncryptedBlob> for BlobRecord {
    fn from(blob: EncryptedBlob) -> Self {
        let kdf_config = match blob.kdf {
            KdfConfig::Argon2id {
                mem_limit_mib,
                ops_limit,
            } => KdfConfigRecord::Argon2id {
                mem_limit_mib,
                ops_limit,
            },
            KdfConfig::Pbkdf2 { iterations } => KdfConfigRecord::Pbkdf2 { iterations },
        };

        Self {
            version: blob.version,
            algorithm: blob.algorithm,
            key_derivation_function: blob.kdf.function(),
            kdf_config,
            salt: STANDARD.encode(&blob.salt),
            nonce: STANDARD.encode(&blob.nonce),
            ciphertext: STANDARD.encode(&blob.ciphertext),
        }
    }
}

impl TryFrom<BlobRecord> for EncryptedBlob {
    type Error = CryptoError;

    fn try_from(record: BlobRecord) -> Result<Self> {
        if record.version > BLOB_VERSION {
            return Err(CryptoError::Encoding(format!(
                "Unsupported blob version {}",
                record.version
            )));
        }

        let kdf = match (record.key_derivation_function, record.kdf_config) {
            (
                KeyDerivationFunction::Argon2id,
                KdfConfigRecord::Argon2id {
                    mem_limit_mib,
                    ops_limit,
                },
            ) => KdfConfig::Argon2id {
                mem_limit_mib,
                ops_limit,
            },
            (KeyDerivationFunction::Pbkdf2, KdfConfigRecord::Pbkdf2 { iterations }) => {
                KdfConfig::Pbkdf2 { iterations }
            }
            (function, _) => {
                return Err(CryptoError::Encoding(format!(
                    "kdfConfig does not match keyDerivationFunction {}",
                    function
                )))
            }
        };

        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| CryptoError::Encoding(format!("Invalid {}: {}", field, e)))
        };

        Ok(Self {
            version: record.version,
            algorithm: record.algorithm,
            kdf,
            salt: decode("salt", &record.salt)?,
            nonce: decode("nonce", &record.nonce)?,
            ciphertext: decode("ciphertext", &record.ciphertext)?,
        })
    }
}
