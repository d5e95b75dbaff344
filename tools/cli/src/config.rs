//! CLI configuration: file-backed defaults with flag overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fieldsync_codec::Codec;

/// Settings for the data layer, loaded from `config.json` in the data
/// directory when present. Command-line flags override individual
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote authority.
    pub endpoint: Option<String>,
    /// Seconds between periodic queue-replay passes.
    pub sync_interval_secs: u64,
    /// Seconds between scheduled backups.
    pub backup_interval_secs: u64,
    /// Number of backups retained after cleanup.
    pub backup_retention: usize,
    /// Codec used for backup artifacts.
    pub codec: Codec,
    /// Compression effort, 0-9.
    pub compression_level: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            sync_interval_secs: 300,
            backup_interval_secs: 24 * 60 * 60,
            backup_retention: 7,
            codec: Codec::default(),
            compression_level: 6,
        }
    }
}

impl Config {
    /// Load configuration from `<data_dir>/config.json`, falling back to
    /// defaults when the file does not exist.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        if endpoint.is_some() {
            self.endpoint = endpoint;
        }
        self
    }
}

/// Default data directory: `<platform data dir>/fieldsync`.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not determine a data directory for this platform")?;
    Ok(base.join("fieldsync"))
}
