//! Ed25519 device identity and the account's device registry.

use crate::vault::OnlineServicesAccount;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

/// A freshly generated Ed25519 keypair for a device.
pub struct DeviceIdentity {
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Generate a new identity from the OS RNG.
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut secret[..]);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn from_account(account: &OnlineServicesAccount) -> Result<Self> {
        Ok(Self::from_signing_key(account.signing_key()?))
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Get the public (verifying) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the public key bytes (32 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key().to_bytes().to_vec()
    }
}

/// A device as the account service knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// The account's first device. Never reaped.
    pub root: bool,
}

/// Account-side device registration.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Register a public key, returning the new device's user id.
    async fn register_device(&self, public_key: &[u8]) -> Result<Uuid>;

    async fn remove_device(&self, id: Uuid) -> Result<()>;

    async fn list_devices(&self) -> Result<Vec<RegisteredDevice>>;

    /// Public key registered for `id`, used to verify sign-in signatures.
    async fn device_public_key(&self, id: Uuid) -> Result<Option<Vec<u8>>>;
}

/// Remove registered devices that never finished pairing: not root, not
/// this device and not linked from `account`. Returns the removed ids.
pub async fn reap_orphaned_devices(
    registry: &dyn DeviceRegistry,
    account: &OnlineServicesAccount,
) -> Result<Vec<Uuid>> {
    let mut removed = Vec::new();
    for device in registry.list_devices().await? {
        if device.root || device.id == account.user_id || account.is_linked(device.id) {
            continue;
        }
        registry.remove_device(device.id).await?;
        removed.push(device.id);
    }

    if !removed.is_empty() {
        info!(count = removed.len(), "Reaped orphaned devices");
    }
    Ok(removed)
}
