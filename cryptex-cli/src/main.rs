use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cryptex_core::backup;
use cryptex_core::crypto::{Algorithm, EnvelopeSettings, KdfConfig, KeyDerivationFunction};
use cryptex_core::sync::{apply_diffs, reconcile, AcceptAll, Diff, DiffKey, DiffSelector};
use cryptex_core::{
    calculate_totp, platform, Credential, CryptexConfig, SqliteVaultStore, Totp, VaultMetadata,
    VaultSession, VaultStore,
};
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Cryptex - local-first, end-to-end-encrypted credential vault
#[derive(Parser)]
#[command(name = "cryptex")]
#[command(about = "Local-first, end-to-end-encrypted credential vault", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Vault database, overriding the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Create {
        name: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// List vaults
    List,

    /// Delete a vault
    Delete {
        /// Vault name or id
        vault: String,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Add a credential to a vault
    Add {
        /// Vault name or id
        vault: String,

        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        username: String,

        /// Password (will prompt if not provided)
        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Tag, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// otpauth:// URI for a TOTP second factor
        #[arg(long)]
        totp: Option<String>,
    },

    /// List or search credentials in a vault
    Entries {
        /// Vault name or id
        vault: String,

        /// Search query
        query: Option<String>,

        /// Show passwords in plain text
        #[arg(long)]
        show_passwords: bool,
    },

    /// Print the current TOTP code for a credential
    Totp {
        /// Vault name or id
        vault: String,

        /// Credential name or id
        entry: String,
    },

    /// Write a vault backup (.cryx)
    Export {
        /// Vault name or id
        vault: String,

        path: PathBuf,
    },

    /// Restore a vault backup (.cryx)
    Import {
        path: PathBuf,

        /// Replace an existing vault with the same id
        #[arg(long)]
        replace: bool,
    },

    /// Reconcile a vault against a backup, choosing which changes to keep
    Merge {
        /// Vault name or id
        vault: String,

        /// Backup to compare against
        path: PathBuf,

        /// Keep every change without asking
        #[arg(long)]
        accept_all: bool,

        /// Also update the backup so both sides match
        #[arg(long)]
        write_back: bool,
    },

    /// Re-encrypt a vault under a new algorithm, KDF or passphrase
    Rekey {
        /// Vault name or id
        vault: String,

        #[arg(long)]
        algorithm: Option<Algorithm>,

        #[arg(long)]
        kdf: Option<KeyDerivationFunction>,

        /// Prompt for a new passphrase
        #[arg(long)]
        passphrase: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(platform::default_config_path);
    let mut config = CryptexConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(database) = cli.database.clone() {
        config.database_path = database;
    }
    let store = SqliteVaultStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;

    run(cli.command, &config, &store).await
}

async fn run(command: Commands, config: &CryptexConfig, store: &SqliteVaultStore) -> Result<()> {
    match command {
        Commands::Create { name, description } => {
            let passphrase = prompt_new_passphrase()?;
            let session = VaultSession::create(
                &name,
                &description,
                &passphrase,
                config.envelope.settings(),
                store,
            )?;
            println!("Created vault '{}' ({})", name, session.id());
        }

        Commands::List => {
            let vaults = store.load_all()?;
            if vaults.is_empty() {
                println!("No vaults. Create one with `cryptex create <name>`.");
            }
            for vault in vaults {
                let envelope = vault
                    .blob
                    .as_ref()
                    .map(|b| format!("{} / {}", b.algorithm, b.key_derivation_function()))
                    .unwrap_or_else(|| "empty".to_string());
                println!(
                    "{}  {:<24} last used {}  [{}]",
                    vault.id,
                    vault.name,
                    vault.last_used.format("%Y-%m-%d %H:%M"),
                    envelope
                );
            }
        }

        Commands::Delete { vault, yes } => {
            let metadata = find_vault(store, &vault)?;
            if !yes && !confirm(&format!("Delete vault '{}'?", metadata.name))? {
                println!("Aborted");
                return Ok(());
            }
            store.delete(metadata.id)?;
            println!("Deleted vault '{}'", metadata.name);
        }

        Commands::Add {
            vault,
            name,
            username,
            password,
            url,
            notes,
            tags,
            totp,
        } => {
            let mut session = unlock(store, &vault).await?;
            let password = match password {
                Some(p) => Zeroizing::new(p),
                None => Zeroizing::new(rpassword::prompt_password("Entry password: ")?),
            };

            let mut credential = Credential::new(name, username, password.as_str()).with_tags(tags);
            if let Some(url) = url {
                credential = credential.with_url(url);
            }
            if let Some(notes) = notes {
                credential = credential.with_notes(notes);
            }
            if let Some(uri) = totp {
                credential = credential.with_totp(Totp::from_uri(&uri)?);
            }

            let id = credential.id;
            let mut working = session.checkout();
            working.upsert_credential(credential);
            session.commit_async(working, store).await?;
            println!("Added entry {}", id);
        }

        Commands::Entries {
            vault,
            query,
            show_passwords,
        } => {
            let session = unlock(store, &vault).await?;
            let matches = session.vault().search(query.as_deref().unwrap_or(""));
            if matches.is_empty() {
                println!("No entries");
            }
            for c in matches {
                let password = if show_passwords {
                    c.password.as_str()
                } else {
                    "********"
                };
                println!("{}  {:<24} {:<24} {}", c.id, c.name, c.username, password);
                if !c.url.is_empty() {
                    println!("    {}", c.url);
                }
                if !c.tags.is_empty() {
                    let tags: Vec<&str> = c.tags.iter().map(String::as_str).collect();
                    println!("    tags: {}", tags.join(", "));
                }
            }
        }

        Commands::Totp { vault, entry } => {
            let session = unlock(store, &vault).await?;
            let credential = session
                .vault()
                .credentials
                .iter()
                .find(|c| c.id.to_string() == entry || c.name.eq_ignore_ascii_case(&entry))
                .ok_or_else(|| anyhow!("No entry named '{}'", entry))?;
            let code = calculate_totp(credential, Utc::now())?;
            println!("{}  ({}s left)", code.code, code.time_remaining);
        }

        Commands::Export { vault, path } => {
            let metadata = find_vault(store, &vault)?;
            let path = with_extension(path, backup::BACKUP_EXTENSION);
            backup::export_vault(&metadata, &path)?;
            println!("Exported '{}' to {}", metadata.name, path.display());
        }

        Commands::Import { path, replace } => {
            let metadata = backup::import_vault(&path)?;
            if !replace && store.load(metadata.id)?.is_some() {
                bail!(
                    "Vault {} already exists; pass --replace to overwrite it",
                    metadata.id
                );
            }
            store.save(&metadata)?;
            println!("Imported vault '{}' ({})", metadata.name, metadata.id);
        }

        Commands::Merge {
            vault,
            path,
            accept_all,
            write_back,
        } => {
            let mut session = unlock(store, &vault).await?;
            let theirs = backup::import_vault(&path)?;
            let backup_passphrase =
                Zeroizing::new(rpassword::prompt_password("Backup passphrase: ")?);
            let remote = VaultSession::unlock_async(theirs, &backup_passphrase).await?;

            let mut accept = AcceptAll;
            let mut prompt = PromptSelector;
            let selector: &mut dyn DiffSelector = if accept_all {
                &mut accept
            } else {
                &mut prompt
            };
            let outcome = reconcile(
                &session.vault().credentials,
                &remote.vault().credentials,
                selector,
            )?;
            if outcome.is_empty() {
                println!("Already in sync");
                return Ok(());
            }

            let mut working = session.checkout();
            apply_diffs(&mut working.credentials, &outcome.to_apply)?;
            session.commit_async(working, store).await?;

            if write_back && !outcome.to_send.is_empty() {
                let mut other = remote.checkout();
                apply_diffs(&mut other.credentials, &outcome.to_send)?;
                let updated =
                    remote
                        .metadata()
                        .with_vault(Some(&other), &backup_passphrase, &remote.settings())?;
                backup::export_vault(&updated, &path)?;
            }
            info!(
                applied = outcome.to_apply.len(),
                sent = outcome.to_send.len(),
                "Merged backup"
            );
            let rest = if write_back {
                "written back to the backup"
            } else {
                "left only in the backup"
            };
            println!(
                "Applied {} change(s); {} change(s) {}",
                outcome.to_apply.len(),
                outcome.to_send.len(),
                rest
            );
        }

        Commands::Rekey {
            vault,
            algorithm,
            kdf,
            passphrase,
        } => {
            let mut session = unlock(store, &vault).await?;
            if algorithm.is_some() || kdf.is_some() {
                let current = session.settings();
                let kdf = match kdf {
                    Some(function) if function != current.kdf.function() => {
                        KdfConfig::default_for(function)
                    }
                    _ => current.kdf,
                };
                let settings = EnvelopeSettings::new(algorithm.unwrap_or(current.algorithm), kdf);
                session.change_envelope(settings, store)?;
                println!("Re-encrypted with {} / {}", settings.algorithm, settings.kdf.function());
            }
            if passphrase {
                let current = Zeroizing::new(rpassword::prompt_password("Current passphrase: ")?);
                let new = prompt_new_passphrase()?;
                session.change_passphrase(&current, &new, store)?;
                println!("Passphrase changed");
            }
        }
    }

    Ok(())
}

fn find_vault(store: &SqliteVaultStore, key: &str) -> Result<VaultMetadata> {
    store
        .find(key)?
        .ok_or_else(|| anyhow!("No vault named '{}'", key))
}

async fn unlock(store: &SqliteVaultStore, key: &str) -> Result<VaultSession> {
    let metadata = find_vault(store, key)?;
    let passphrase = Zeroizing::new(rpassword::prompt_password(format!(
        "Passphrase for '{}': ",
        metadata.name
    ))?);
    VaultSession::unlock_async(metadata, &passphrase)
        .await
        .map_err(|e| {
            if e.is_decryption_failure() {
                anyhow!("Wrong passphrase or damaged vault")
            } else {
                e.into()
            }
        })
}

fn prompt_new_passphrase() -> Result<Zeroizing<String>> {
    let first = Zeroizing::new(rpassword::prompt_password("New passphrase: ")?);
    if first.is_empty() {
        bail!("Passphrase cannot be empty");
    }
    let second = Zeroizing::new(rpassword::prompt_password("Repeat passphrase: ")?);
    if *first != *second {
        bail!("Passphrases do not match");
    }
    Ok(first)
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn with_extension(path: PathBuf, extension: &str) -> PathBuf {
    if path.extension().is_some() {
        path
    } else {
        path.with_extension(extension)
    }
}

/// Asks about each proposed change on the terminal.
struct PromptSelector;

impl DiffSelector for PromptSelector {
    fn select(&mut self, diffs: &[Diff]) -> HashSet<DiffKey> {
        diffs
            .iter()
            .filter(|d| confirm(&format!("Keep {}?", d)).unwrap_or(false))
            .map(Diff::key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["cryptex", "list", "--database", "/tmp/v.db", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/v.db")));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn rekey_parses_envelope_choices() {
        let cli = Cli::try_parse_from([
            "cryptex",
            "rekey",
            "Personal",
            "--algorithm",
            "aes-256-gcm",
            "--kdf",
            "pbkdf2",
        ])
        .unwrap();
        match cli.command {
            Commands::Rekey { algorithm, kdf, .. } => {
                assert_eq!(algorithm, Some(Algorithm::Aes256Gcm));
                assert_eq!(kdf, Some(KeyDerivationFunction::Pbkdf2));
            }
            _ => panic!("expected rekey"),
        }
    }

    #[test]
    fn backup_extension_added_only_when_missing() {
        assert_eq!(
            with_extension(PathBuf::from("personal"), "cryx"),
            PathBuf::from("personal.cryx")
        );
        assert_eq!(
            with_extension(PathBuf::from("personal.json"), "cryx"),
            PathBuf::from("personal.json")
        );
    }
}
