//! Engine configuration management.
//!
//! This module handles loading and saving the sync configuration, which
//! includes the backend URL, the auth token, and the trigger timings.
//!
//! Configuration is stored at `~/.config/syncline/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "syncline";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Delay between an offline->online transition and the automatic sync pass.
pub const DEFAULT_AUTO_SYNC_DELAY_MS: u64 = 1500;

/// Interval at which `pending_count` is recomputed from the queue.
pub const DEFAULT_PENDING_REFRESH_SECS: u64 = 30;

/// Lifetime of the persisted query cache snapshot.
pub const DEFAULT_SNAPSHOT_TTL_HOURS: u64 = 24;

pub const DEFAULT_TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub auto_sync_delay_ms: u64,
    pub pending_refresh_secs: u64,
    pub snapshot_ttl_hours: u64,
    pub temp_id_prefix: String,
    pub storage_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            auto_sync_delay_ms: DEFAULT_AUTO_SYNC_DELAY_MS,
            pending_refresh_secs: DEFAULT_PENDING_REFRESH_SECS,
            snapshot_ttl_hours: DEFAULT_SNAPSHOT_TTL_HOURS,
            temp_id_prefix: DEFAULT_TEMP_ID_PREFIX.to_string(),
            storage_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted queue and cache snapshot.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn auto_sync_delay(&self) -> Duration {
        Duration::from_millis(self.auto_sync_delay_ms)
    }

    pub fn pending_refresh_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_secs(self.pending_refresh_secs.max(1))
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_hours * 60 * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.auto_sync_delay(), Duration::from_millis(1500));
        assert_eq!(config.pending_refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.snapshot_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.temp_id_prefix, "temp-");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"base_url": "http://localhost:8080"}"#).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.auto_sync_delay_ms, DEFAULT_AUTO_SYNC_DELAY_MS);
    }

    #[test]
    fn test_storage_dir_override() {
        let config = SyncConfig {
            storage_dir: Some(PathBuf::from("/tmp/syncline-test")),
            ..Default::default()
        };
        assert_eq!(config.storage_dir().unwrap(), PathBuf::from("/tmp/syncline-test"));
    }

    #[test]
    fn test_zero_refresh_interval_clamped() {
        let config = SyncConfig {
            pending_refresh_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.pending_refresh_interval(), Duration::from_secs(1));
    }
}
