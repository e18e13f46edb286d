//! Out-of-band files: `.cryx` vault backups and `.cryxa` pairing transfers.
//!
//! Both are plain JSON. A `.cryx` file holds a whole [`VaultMetadata`]
//! record; a `.cryxa` file holds just the wrapped [`EncryptedBlob`]. Files are
//! written to a temporary sibling and renamed into place.

use crate::crypto::EncryptedBlob;
use crate::vault::VaultMetadata;
use crate::{CryptexError, Result};
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const BACKUP_EXTENSION: &str = "cryx";
pub const TRANSFER_EXTENSION: &str = "cryxa";

/// Write a vault backup. The record must carry a sealed blob.
pub fn export_vault(metadata: &VaultMetadata, path: &Path) -> Result<()> {
    if metadata.blob.is_none() {
        return Err(CryptexError::InvalidState {
            expected: "vault with encrypted contents",
            actual: format!("vault '{}' has no blob", metadata.name),
        });
    }
    let json = serde_json::to_string_pretty(metadata)?;
    write_atomic(path, json.as_bytes())?;
    info!(vault = %metadata.id, path = %path.display(), "Exported vault backup");
    Ok(())
}

pub fn import_vault(path: &Path) -> Result<VaultMetadata> {
    let content = std::fs::read_to_string(path)?;
    let metadata: VaultMetadata = serde_json::from_str(&content)
        .map_err(|e| CryptexError::InvalidInput(format!("Not a vault backup: {}", e)))?;
    if metadata.blob.is_none() {
        return Err(CryptexError::InvalidInput(
            "Vault backup has no encrypted contents".to_string(),
        ));
    }
    Ok(metadata)
}

pub fn export_transfer(blob: &EncryptedBlob, path: &Path) -> Result<()> {
    let json = blob.to_json_pretty()?;
    write_atomic(path, json.as_bytes())?;
    info!(path = %path.display(), "Exported pairing transfer");
    Ok(())
}

pub fn import_transfer(path: &Path) -> Result<EncryptedBlob> {
    let content = std::fs::read_to_string(path)?;
    EncryptedBlob::from_json(&content)
        .map_err(|e| CryptexError::InvalidInput(format!("Not a pairing transfer: {}", e)))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CryptexError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, Algorithm, EnvelopeSettings, KdfConfig};
    use crate::{Credential, Vault};

    fn fast() -> EnvelopeSettings {
        EnvelopeSettings::new(Algorithm::Aes256Gcm, KdfConfig::Pbkdf2 { iterations: 5 })
    }

    #[test]
    fn vault_backup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("personal.{}", BACKUP_EXTENSION));

        let mut vault = Vault::new();
        vault.upsert_credential(Credential::new("GitHub", "alice", "pw"));
        let meta = VaultMetadata::new("Personal", "")
            .with_vault(Some(&vault), "pw", &fast())
            .unwrap();

        export_vault(&meta, &path).unwrap();
        let imported = import_vault(&path).unwrap();
        assert_eq!(imported, meta);
        assert_eq!(imported.unlock("pw").unwrap().credentials.len(), 1);
    }

    #[test]
    fn empty_vault_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let meta = VaultMetadata::new("Empty", "");
        assert!(export_vault(&meta, &dir.path().join("empty.cryx")).is_err());
        assert!(!dir.path().join("empty.cryx").exists());
    }

    #[test]
    fn transfer_roundtrip_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("device.{}", TRANSFER_EXTENSION));
        std::fs::write(&path, "stale").unwrap();

        let blob = crypto::encrypt(b"binding", "mnemonic", &fast()).unwrap();
        export_transfer(&blob, &path).unwrap();
        assert_eq!(import_transfer(&path).unwrap(), blob);
    }

    #[test]
    fn garbage_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.cryxa");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            import_transfer(&path),
            Err(CryptexError::InvalidInput(_))
        ));
        assert!(matches!(
            import_vault(&path),
            Err(CryptexError::InvalidInput(_))
        ));
    }
}
