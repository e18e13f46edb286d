//! Platform-specific locations for data and configuration

use std::path::PathBuf;

const APP_DIR: &str = "Cryptex";

/// Get the platform-specific data directory for storing vaults
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\Cryptex
/// - macOS: ~/Library/Application Support/Cryptex
/// - Linux/Other: ~/.local/share/Cryptex
pub fn data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the platform-specific config directory
pub fn config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

pub fn default_database_path() -> PathBuf {
    data_dir().join("vaults.db")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}
