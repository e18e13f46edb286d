//! Vault working set and its persisted metadata record.

use crate::credential::Credential;
use crate::crypto::{self, EncryptedBlob, EnvelopeSettings};
use crate::{CryptexError, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// A device this account has been paired with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDevice {
    /// The remote device's user id.
    pub id: Uuid,
    /// Chosen locally; never sent to the peer.
    pub name: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

/// Account-binding material for a device that uses online services.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineServicesAccount {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "b64_secret")]
    pub private_key: Zeroizing<Vec<u8>>,
    #[serde(default)]
    pub linked_devices: Vec<LinkedDevice>,
}

impl OnlineServicesAccount {
    pub fn new(user_id: Uuid, signing_key: &SigningKey) -> Self {
        Self {
            user_id,
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            private_key: Zeroizing::new(signing_key.to_bytes().to_vec()),
            linked_devices: Vec::new(),
        }
    }

    /// Rebuild the Ed25519 signing key from the stored private key.
    pub fn signing_key(&self) -> Result<SigningKey> {
        let bytes: [u8; 32] = self.private_key.as_slice().try_into().map_err(|_| {
            CryptexError::Crypto(crypto::CryptoError::InvalidKeyLength {
                expected: 32,
                got: self.private_key.len(),
            })
        })?;
        let bytes = Zeroizing::new(bytes);
        Ok(SigningKey::from_bytes(&bytes))
    }

    pub fn linked_device(&self, id: Uuid) -> Option<&LinkedDevice> {
        self.linked_devices.iter().find(|d| d.id == id)
    }

    pub fn is_linked(&self, id: Uuid) -> bool {
        self.linked_device(id).is_some()
    }

    /// Record a newly paired device. Re-linking an existing id renames it.
    pub fn link_device(&mut self, id: Uuid, name: impl Into<String>, now: DateTime<Utc>) {
        let name = name.into();
        match self.linked_devices.iter_mut().find(|d| d.id == id) {
            Some(device) => {
                device.name = name;
                device.last_sync = Some(now);
            }
            None => self.linked_devices.push(LinkedDevice {
                id,
                name,
                last_sync: Some(now),
            }),
        }
    }

    pub fn unlink_device(&mut self, id: Uuid) -> bool {
        let before = self.linked_devices.len();
        self.linked_devices.retain(|d| d.id != id);
        self.linked_devices.len() != before
    }

    pub fn record_sync(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let device = self
            .linked_devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| CryptexError::NotFound(format!("linked device {}", id)))?;
        device.last_sync = Some(now);
        Ok(())
    }
}

impl std::fmt::Debug for OnlineServicesAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineServicesAccount")
            .field("user_id", &self.user_id)
            .field("public_key", &hex::encode(&self.public_key))
            .field("private_key", &"<redacted>")
            .field("linked_devices", &self.linked_devices)
            .finish()
    }
}

/// The decrypted working set. Only exists while unlocked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub online_services_account: Option<OnlineServicesAccount>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credential(&self, id: Uuid) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn credential_mut(&mut self, id: Uuid) -> Option<&mut Credential> {
        self.credentials.iter_mut().find(|c| c.id == id)
    }

    /// Insert or replace by id.
    pub fn upsert_credential(&mut self, credential: Credential) {
        match self.credentials.iter_mut().find(|c| c.id == credential.id) {
            Some(slot) => *slot = credential,
            None => self.credentials.push(credential),
        }
    }

    pub fn remove_credential(&mut self, id: Uuid) -> Option<Credential> {
        let index = self.credentials.iter().position(|c| c.id == id)?;
        Some(self.credentials.remove(index))
    }

    /// Case-insensitive search on name, username, url and tags.
    pub fn search(&self, query: &str) -> Vec<&Credential> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.credentials.iter().collect();
        }
        self.credentials
            .iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&query)
                    || c.username.to_lowercase().contains(&query)
                    || c.url.to_lowercase().contains(&query)
                    || c.tags.iter().any(|t| t.to_lowercase() == query)
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    /// Parse a decrypted payload. Malformed plaintext is reported like any
    /// other decryption failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| crypto::CryptoError::Decryption.into())
    }

    pub fn seal(&self, passphrase: &str, settings: &EnvelopeSettings) -> Result<EncryptedBlob> {
        let payload = self.to_bytes()?;
        Ok(crypto::encrypt(&payload, passphrase, settings)?)
    }

    pub fn open(blob: &EncryptedBlob, passphrase: &str) -> Result<Self> {
        let payload = crypto::decrypt(blob, passphrase)?;
        Self::from_bytes(&payload)
    }
}

/// Durable record of one vault. Owned by local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultMetadata {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub blob: Option<EncryptedBlob>,
}

impl VaultMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            created_at: now,
            last_used: now,
            blob: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_none()
    }

    /// Decrypt the stored blob.
    pub fn unlock(&self, passphrase: &str) -> Result<Vault> {
        let blob = self.blob.as_ref().ok_or_else(|| CryptexError::InvalidState {
            expected: "vault with encrypted contents",
            actual: format!("vault '{}' has no blob", self.name),
        })?;
        Vault::open(blob, passphrase)
    }

    /// Return a copy with the blob fully replaced and `last_used` bumped.
    /// The receiver is not modified.
    pub fn with_vault(
        &self,
        vault: Option<&Vault>,
        passphrase: &str,
        settings: &EnvelopeSettings,
    ) -> Result<Self> {
        let blob = match vault {
            Some(vault) => Some(vault.seal(passphrase, settings)?),
            None => None,
        };
        Ok(Self {
            blob,
            last_used: Utc::now(),
            ..self.clone()
        })
    }
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod b64_secret {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(
        bytes: &Zeroizing<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(STANDARD.encode(bytes.as_slice()));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Zeroizing<Vec<u8>>, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        STANDARD
            .decode(encoded.as_bytes())
            .map(Zeroizing::new)
            .map_err(serde::de::Error::custom)
    }
}
