//! Configuration file handling
//!
//! Config directory: ~/.shardline/
//!
//! The file holds a serialized `ClientConfig`; every section is optional:
//! ```toml
//! [chunking]
//! block_size = 2097152
//!
//! [coordinator]
//! extra_percent = 20
//! backup_delay_ms = 2000
//! ```

use anyhow::{Context, Result};
use shardline_client::ClientConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the config directory path, creating it if needed
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let config_dir = home.join(".shardline");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory ~/.shardline/")?;
    }

    Ok(config_dir)
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve `explicit` or the default location
pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => config_file_path(),
    }
}

/// Load configuration, then apply `SHARDLINE_*` environment overrides.
/// Falls back to defaults if the file is missing or invalid.
pub fn load_config(explicit: Option<&Path>) -> ClientConfig {
    let config = match resolve_path(explicit) {
        Ok(path) if path.exists() => match ClientConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: Failed to load {}: {}", path.display(), e);
                ClientConfig::default()
            }
        },
        _ => ClientConfig::default(),
    };
    config.with_env_overrides()
}

pub fn save_config(path: &Path, config: &ClientConfig) -> Result<()> {
    let content = config.to_toml().context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    fs::write(path, content).context("Failed to write config file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ClientConfig::default();
        config.coordinator.extra_percent = 35;
        save_config(&path, &config).unwrap();

        let loaded = load_config(Some(&path));
        assert_eq!(loaded.coordinator.extra_percent, 35);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "chunking = 12").unwrap();

        let loaded = load_config(Some(&path));
        assert_eq!(loaded.chunking.block_size, ClientConfig::default().chunking.block_size);
    }
}
