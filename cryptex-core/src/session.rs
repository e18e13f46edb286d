//! Explicit unlocked-vault session.
//!
//! A `VaultSession` is the single owner of one unlocked vault. Work that may
//! fail halfway (reconciliation, pairing) happens on a [`checkout`] copy and is
//! only swapped in by [`commit`] after the store accepted the new record.
//!
//! [`checkout`]: VaultSession::checkout
//! [`commit`]: VaultSession::commit

use crate::crypto::{self, EncryptedBlob, EnvelopeSettings};
use crate::storage::VaultStore;
use crate::vault::{Vault, VaultMetadata};
use crate::{CryptexError, Result};
use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

pub struct VaultSession {
    metadata: VaultMetadata,
    vault: Vault,
    passphrase: Zeroizing<String>,
    settings: EnvelopeSettings,
}

impl VaultSession {
    /// Create, seal and persist a new empty vault.
    pub fn create(
        name: &str,
        description: &str,
        passphrase: &str,
        settings: EnvelopeSettings,
        store: &dyn VaultStore,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(CryptexError::InvalidInput(
                "Vault name cannot be empty".to_string(),
            ));
        }
        settings.validate()?;

        let vault = Vault::new();
        let metadata = VaultMetadata::new(name.trim(), description).with_vault(
            Some(&vault),
            passphrase,
            &settings,
        )?;
        store.save(&metadata)?;
        info!(vault = %metadata.id, "Created vault");

        Ok(Self {
            metadata,
            vault,
            passphrase: Zeroizing::new(passphrase.to_string()),
            settings,
        })
    }

    /// Decrypt a stored vault. The session keeps the blob's own envelope
    /// settings for later commits.
    pub fn unlock(metadata: VaultMetadata, passphrase: &str) -> Result<Self> {
        let vault = metadata.unlock(passphrase)?;
        Ok(Self::unlocked(metadata, vault, passphrase))
    }

    /// [`unlock`](Self::unlock) with the key derivation on the blocking pool.
    pub async fn unlock_async(metadata: VaultMetadata, passphrase: &str) -> Result<Self> {
        let blob = sealed_blob(&metadata)?.clone();
        let payload =
            crypto::decrypt_async(blob, Zeroizing::new(passphrase.to_string())).await?;
        let vault = Vault::from_bytes(&payload)?;
        Ok(Self::unlocked(metadata, vault, passphrase))
    }

    fn unlocked(metadata: VaultMetadata, vault: Vault, passphrase: &str) -> Self {
        let settings = metadata
            .blob
            .as_ref()
            .map(EncryptedBlob::settings)
            .unwrap_or_default();
        info!(vault = %metadata.id, "Unlocked vault");
        Self {
            metadata,
            vault,
            passphrase: Zeroizing::new(passphrase.to_string()),
            settings,
        }
    }

    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    pub fn metadata(&self) -> &VaultMetadata {
        &self.metadata
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn settings(&self) -> EnvelopeSettings {
        self.settings
    }

    /// An independent copy of the working set to mutate.
    pub fn checkout(&self) -> Vault {
        self.vault.clone()
    }

    /// Seal `vault`, save it, and only then make it the session's vault.
    /// On any error the session is unchanged.
    pub fn commit(&mut self, vault: Vault, store: &dyn VaultStore) -> Result<()> {
        let metadata = self
            .metadata
            .with_vault(Some(&vault), &self.passphrase, &self.settings)?;
        self.install(metadata, vault, store)
    }

    /// [`commit`](Self::commit) with the key derivation on the blocking pool.
    pub async fn commit_async(&mut self, vault: Vault, store: &dyn VaultStore) -> Result<()> {
        let mut payload = vault.to_bytes()?;
        let blob = crypto::encrypt_async(
            std::mem::take(&mut *payload),
            self.passphrase.clone(),
            self.settings,
        )
        .await?;

        let metadata = VaultMetadata {
            blob: Some(blob),
            last_used: Utc::now(),
            ..self.metadata.clone()
        };
        self.install(metadata, vault, store)
    }

    /// Checkout, mutate and commit in one step.
    pub fn update<F>(&mut self, store: &dyn VaultStore, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vault) -> Result<()>,
    {
        let mut vault = self.checkout();
        f(&mut vault)?;
        self.commit(vault, store)
    }

    /// Re-encrypt under a different algorithm or KDF.
    pub fn change_envelope(
        &mut self,
        settings: EnvelopeSettings,
        store: &dyn VaultStore,
    ) -> Result<()> {
        settings.validate()?;
        let metadata = self
            .metadata
            .with_vault(Some(&self.vault), &self.passphrase, &settings)?;
        store.save(&metadata)?;
        self.metadata = metadata;
        self.settings = settings;
        info!(
            vault = %self.metadata.id,
            algorithm = %settings.algorithm,
            kdf = %settings.kdf.function(),
            "Changed vault envelope"
        );
        Ok(())
    }

    /// Re-encrypt under a new passphrase after checking the current one.
    pub fn change_passphrase(
        &mut self,
        current: &str,
        new: &str,
        store: &dyn VaultStore,
    ) -> Result<()> {
        if !bool::from(current.as_bytes().ct_eq(self.passphrase.as_bytes())) {
            return Err(crypto::CryptoError::Decryption.into());
        }
        if new.is_empty() {
            return Err(CryptexError::InvalidInput(
                "Passphrase cannot be empty".to_string(),
            ));
        }
        let metadata = self
            .metadata
            .with_vault(Some(&self.vault), new, &self.settings)?;
        store.save(&metadata)?;
        self.metadata = metadata;
        self.passphrase = Zeroizing::new(new.to_string());
        info!(vault = %self.metadata.id, "Changed vault passphrase");
        Ok(())
    }

    /// Drop the decrypted vault and passphrase.
    pub fn lock(self) -> VaultMetadata {
        info!(vault = %self.metadata.id, "Locked vault");
        self.metadata
    }

    fn install(
        &mut self,
        metadata: VaultMetadata,
        vault: Vault,
        store: &dyn VaultStore,
    ) -> Result<()> {
        store.save(&metadata)?;
        self.metadata = metadata;
        self.vault = vault;
        Ok(())
    }
}

fn sealed_blob(metadata: &VaultMetadata) -> Result<&EncryptedBlob> {
    metadata.blob.as_ref().ok_or_else(|| CryptexError::InvalidState {
        expected: "vault with encrypted contents",
        actual: format!("vault '{}' has no blob", metadata.name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Algorithm, KdfConfig};
    use crate::storage::SqliteVaultStore;
    use crate::Credential;

    fn fast() -> EnvelopeSettings {
        EnvelopeSettings::new(Algorithm::Aes256Gcm, KdfConfig::Pbkdf2 { iterations: 10 })
    }

    struct FailingStore;

    impl VaultStore for FailingStore {
        fn save(&self, _: &VaultMetadata) -> Result<()> {
            Err(CryptexError::Storage("disk full".to_string()))
        }
        fn load_all(&self) -> Result<Vec<VaultMetadata>> {
            Ok(Vec::new())
        }
        fn load(&self, _: Uuid) -> Result<Option<VaultMetadata>> {
            Ok(None)
        }
        fn delete(&self, _: Uuid) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn create_commit_and_unlock() {
        let store = SqliteVaultStore::in_memory().unwrap();
        let mut session = VaultSession::create("Personal", "", "pw", fast(), &store).unwrap();

        session
            .update(&store, |vault| {
                vault.upsert_credential(Credential::new("GitHub", "alice", "x"));
                Ok(())
            })
            .unwrap();
        assert_eq!(session.vault().credentials.len(), 1);

        let metadata = session.lock();
        let stored = store.load(metadata.id).unwrap().unwrap();
        let reopened = VaultSession::unlock(stored, "pw").unwrap();
        assert_eq!(reopened.vault().credentials.len(), 1);
        assert_eq!(reopened.settings(), fast());
    }

    #[test]
    fn failed_save_leaves_session_unchanged() {
        let store = SqliteVaultStore::in_memory().unwrap();
        let mut session = VaultSession::create("Personal", "", "pw", fast(), &store).unwrap();
        let before = session.metadata().clone();

        let mut copy = session.checkout();
        copy.upsert_credential(Credential::new("GitHub", "alice", "x"));
        assert!(session.commit(copy, &FailingStore).is_err());

        assert!(session.vault().credentials.is_empty());
        assert_eq!(session.metadata(), &before);
    }

    #[test]
    fn checkout_is_independent() {
        let store = SqliteVaultStore::in_memory().unwrap();
        let session = VaultSession::create("Personal", "", "pw", fast(), &store).unwrap();
        let mut copy = session.checkout();
        copy.upsert_credential(Credential::new("GitHub", "alice", "x"));
        assert!(session.vault().credentials.is_empty());
    }

    #[test]
    fn change_envelope_and_passphrase() {
        let store = SqliteVaultStore::in_memory().unwrap();
        let mut session = VaultSession::create("Personal", "", "pw", fast(), &store).unwrap();

        let xchacha = EnvelopeSettings::new(
            Algorithm::XChaCha20Poly1305,
            KdfConfig::Pbkdf2 { iterations: 20 },
        );
        session.change_envelope(xchacha, &store).unwrap();
        let blob = session.metadata().blob.clone().unwrap();
        assert_eq!(blob.algorithm, Algorithm::XChaCha20Poly1305);

        assert!(session.change_passphrase("wrong", "new", &store).is_err());
        session.change_passphrase("pw", "new", &store).unwrap();

        let stored = store.load(session.id()).unwrap().unwrap();
        assert!(VaultSession::unlock(stored.clone(), "pw").is_err());
        assert!(VaultSession::unlock(stored, "new").is_ok());
    }

    #[test]
    fn create_rejects_bad_input() {
        let store = SqliteVaultStore::in_memory().unwrap();
        assert!(matches!(
            VaultSession::create("  ", "", "pw", fast(), &store),
            Err(CryptexError::InvalidInput(_))
        ));
        let bad = EnvelopeSettings::new(Algorithm::Aes256Gcm, KdfConfig::Pbkdf2 { iterations: 0 });
        assert!(matches!(
            VaultSession::create("Personal", "", "pw", bad, &store),
            Err(CryptexError::Crypto(crypto::CryptoError::Configuration(_)))
        ));
    }

    #[tokio::test]
    async fn async_commit_and_unlock() {
        let store = SqliteVaultStore::in_memory().unwrap();
        let mut session = VaultSession::create("Personal", "", "pw", fast(), &store).unwrap();
        let mut copy = session.checkout();
        copy.upsert_credential(Credential::new("GitHub", "alice", "x"));
        session.commit_async(copy, &store).await.unwrap();

        let stored = store.load(session.id()).unwrap().unwrap();
        let reopened = VaultSession::unlock_async(stored, "pw").await.unwrap();
        assert_eq!(reopened.vault().credentials.len(), 1);

        let stored = store.load(session.id()).unwrap().unwrap();
        assert!(VaultSession::unlock_async(stored, "nope").await.is_err());
    }
}
