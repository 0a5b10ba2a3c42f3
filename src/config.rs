use std::path::PathBuf;

use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::provider::QualityTier;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Root for the task file, credential file and downloads directory.
    pub data_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    /// Length of the rate-limit cooldown window.
    pub retry_interval_seconds: u64,
    /// How often the scheduler scans for tasks whose cooldown has elapsed.
    pub retry_check_interval_seconds: u64,
    /// Failed/cancelled records kept before oldest-first pruning.
    pub history_retention: usize,
    /// Quality tiers in priority order, best first.
    pub quality_order: Vec<QualityTier>,
    /// Upstream endpoint that resolves a song mid to a download URL.
    pub resolver_url: String,
    pub notification: NotificationConfig,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook: WebhookConfig,
    pub bark: BarkConfig,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BarkConfig {
    pub enabled: bool,
    pub server_url: String,
    pub device_key: String,
}

impl Default for BarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: "https://api.day.app".to_string(),
            device_key: String::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            max_concurrent_downloads: 5,
            retry_interval_seconds: 24 * 3600,
            retry_check_interval_seconds: 60,
            history_retention: 500,
            quality_order: QualityTier::default_order(),
            resolver_url: "http://127.0.0.1:3200/api/song/url".to_string(),
            notification: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the given path (or the platform config dir), writing the
    /// defaults on first run. Environment variables override the file.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)?
        } else {
            let config = AppConfig::default();
            config.save(&config_path)?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config("could not find config directory".to_string()))?;
        Ok(config_dir.join("tune-vault").join("config.json"))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = read_env_usize("MAX_CONCURRENT_DOWNLOADS") {
            info!("MAX_CONCURRENT_DOWNLOADS={} overrides config file", value);
            self.max_concurrent_downloads = value;
        }
        if let Some(value) = read_env_usize("RETRY_INTERVAL_SECONDS") {
            info!("RETRY_INTERVAL_SECONDS={} overrides config file", value);
            self.retry_interval_seconds = value as u64;
        }
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.data_dir.join("download_tasks.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.retry_interval_seconds, 86_400);
        assert_eq!(config.retry_check_interval_seconds, 60);
        assert_eq!(config.history_retention, 500);
        assert_eq!(config.quality_order.first(), Some(&QualityTier::Master));
    }

    #[test]
    fn first_run_writes_defaults_and_partial_files_fill_in() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = AppConfig::load(Some(path.clone())).unwrap();
        assert!(path.exists());
        assert_eq!(config.history_retention, 500);

        // A sparse hand-written file keeps defaults for everything absent.
        std::fs::write(&path, r#"{"max_concurrent_downloads": 2}"#).unwrap();
        let config = AppConfig::load(Some(path)).unwrap();
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.retry_interval_seconds, 86_400);
        assert_eq!(config.quality_order.len(), 13);
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = AppConfig {
            data_dir: PathBuf::from("/tmp/tv"),
            ..AppConfig::default()
        };
        assert_eq!(config.tasks_file(), PathBuf::from("/tmp/tv/download_tasks.json"));
        assert_eq!(config.downloads_dir(), PathBuf::from("/tmp/tv/downloads"));
        assert_eq!(config.credentials_file(), PathBuf::from("/tmp/tv/credentials.json"));
    }
}
