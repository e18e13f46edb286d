//! Local configuration loaded from TOML.

use crate::crypto::{Algorithm, EnvelopeSettings, KdfConfig, KeyDerivationFunction};
use crate::platform;
use crate::{CryptexError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptexConfig {
    pub database_path: PathBuf,
    pub envelope: EnvelopeConfig,
    pub pairing: PairingConfig,
}

impl Default for CryptexConfig {
    fn default() -> Self {
        Self {
            database_path: platform::default_database_path(),
            envelope: EnvelopeConfig::default(),
            pairing: PairingConfig::default(),
        }
    }
}

/// Envelope defaults for newly sealed vaults. Existing blobs always open
/// with the parameters recorded inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub algorithm: Algorithm,
    pub kdf: KeyDerivationFunction,
    pub mem_limit_mib: u32,
    pub ops_limit: u32,
    pub pbkdf2_iterations: u32,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::XChaCha20Poly1305,
            kdf: KeyDerivationFunction::Argon2id,
            mem_limit_mib: 64,
            ops_limit: 3,
            pbkdf2_iterations: 600_000,
        }
    }
}

impl EnvelopeConfig {
    pub fn settings(&self) -> EnvelopeSettings {
        let kdf = match self.kdf {
            KeyDerivationFunction::Argon2id => KdfConfig::Argon2id {
                mem_limit_mib: self.mem_limit_mib,
                ops_limit: self.ops_limit,
            },
            KeyDerivationFunction::Pbkdf2 => KdfConfig::Pbkdf2 {
                iterations: self.pbkdf2_iterations,
            },
        };
        EnvelopeSettings::new(self.algorithm, kdf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Give up waiting for the peer after this many seconds. Unset means
    /// wait until the operator cancels.
    pub signaling_timeout_secs: Option<u64>,
    /// Name recorded for devices paired from this machine.
    pub device_name: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            signaling_timeout_secs: None,
            device_name: "New device".to_string(),
        }
    }
}

impl PairingConfig {
    pub fn signaling_timeout(&self) -> Option<Duration> {
        self.signaling_timeout_secs.map(Duration::from_secs)
    }
}

impl CryptexConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CryptexError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.envelope
            .settings()
            .validate()
            .map_err(|e| CryptexError::Config(e.to_string()))?;
        if self.pairing.signaling_timeout_secs == Some(0) {
            return Err(CryptexError::Config(
                "pairing.signaling_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CryptexError::Config(e.to_string()))
    }
}
