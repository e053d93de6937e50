//! Settings service
//!
//! Engine tunables live in `settings.json` in the app data directory.
//! API credentials live in the database settings table so the API client
//! can read them fresh on every request.

use crate::api::client::{base_url, device_token};
use crate::config::{
    API_BASE_BACKOFF_MS, API_BASE_URL_KEY, API_MAX_ATTEMPTS, DEVICE_TOKEN_KEY,
    MAX_OUTBOX_RETRIES, OUTBOX_BATCH_LIMIT, PING_BATCH_LIMIT, PING_RETENTION_DAYS,
    RIDE_DISTANCE_FILTER_M, RIDE_INTERVAL_MS, SETTINGS_FILE_NAME, SHIFT_SUMMARY_DELAY_SECS,
    SYNC_INTERVAL_SECS, WAITING_DISTANCE_FILTER_M, WAITING_INTERVAL_MS,
};
use crate::database::Repository;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Sync engine tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_outbox_batch")]
    pub outbox_batch_limit: i64,
    #[serde(default = "default_ping_batch")]
    pub ping_batch_limit: i64,
    #[serde(default = "default_max_retries")]
    pub max_outbox_retries: i64,
    #[serde(default = "default_ping_retention")]
    pub ping_retention_days: i64,
}

fn default_sync_interval() -> u64 {
    SYNC_INTERVAL_SECS
}

fn default_outbox_batch() -> i64 {
    OUTBOX_BATCH_LIMIT
}

fn default_ping_batch() -> i64 {
    PING_BATCH_LIMIT
}

fn default_max_retries() -> i64 {
    MAX_OUTBOX_RETRIES
}

fn default_ping_retention() -> i64 {
    PING_RETENTION_DAYS
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            outbox_batch_limit: default_outbox_batch(),
            ping_batch_limit: default_ping_batch(),
            max_outbox_retries: default_max_retries(),
            ping_retention_days: default_ping_retention(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Direct API call retry tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    API_MAX_ATTEMPTS
}

fn default_base_backoff() -> u64 {
    API_BASE_BACKOFF_MS
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
        }
    }
}

/// Location fix cadence per tracking mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSettings {
    #[serde(default = "default_waiting_interval")]
    pub waiting_interval_ms: u64,
    #[serde(default = "default_waiting_filter")]
    pub waiting_distance_filter_m: f64,
    #[serde(default = "default_ride_interval")]
    pub ride_interval_ms: u64,
    #[serde(default = "default_ride_filter")]
    pub ride_distance_filter_m: f64,
}

fn default_waiting_interval() -> u64 {
    WAITING_INTERVAL_MS
}

fn default_waiting_filter() -> f64 {
    WAITING_DISTANCE_FILTER_M
}

fn default_ride_interval() -> u64 {
    RIDE_INTERVAL_MS
}

fn default_ride_filter() -> f64 {
    RIDE_DISTANCE_FILTER_M
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            waiting_interval_ms: default_waiting_interval(),
            waiting_distance_filter_m: default_waiting_filter(),
            ride_interval_ms: default_ride_interval(),
            ride_distance_filter_m: default_ride_filter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Seconds the shift summary is shown before returning to idle
    #[serde(default = "default_summary_delay")]
    pub shift_summary_delay_secs: u64,
}

fn default_summary_delay() -> u64 {
    SHIFT_SUMMARY_DELAY_SECS
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            shift_summary_delay_secs: default_summary_delay(),
        }
    }
}

/// Contents of `settings.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppSettings {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
}

/// Service for settings file and API credentials
#[derive(Clone)]
pub struct SettingsService {
    settings_path: PathBuf,
    repo: Repository,
}

impl SettingsService {
    pub fn new(app_data_dir: PathBuf, repo: Repository) -> Self {
        Self {
            settings_path: app_data_dir.join(SETTINGS_FILE_NAME),
            repo,
        }
    }

    /// Load settings from disk or create default if not exists
    pub async fn load(&self) -> Result<AppSettings> {
        if !self.settings_path.exists() {
            tracing::info!("Settings file not found, creating default settings");
            let default = AppSettings::default();
            self.save(&default).await?;
            return Ok(default);
        }

        let content = fs::read_to_string(&self.settings_path).await?;
        let settings: AppSettings = serde_json::from_str(&content)
            .map_err(|e| AppError::Generic(format!("Failed to parse settings: {}", e)))?;

        Ok(settings)
    }

    /// Save settings to disk
    pub async fn save(&self, settings: &AppSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| AppError::Generic(format!("Failed to serialize settings: {}", e)))?;

        fs::write(&self.settings_path, content).await?;
        tracing::info!("Settings saved to {:?}", self.settings_path);

        Ok(())
    }

    pub async fn get_api_base_url(&self) -> Result<String> {
        base_url(&self.repo).await
    }

    /// Store the API base URL without a trailing slash
    pub async fn set_api_base_url(&self, url: &str) -> Result<()> {
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(AppError::Validation("API base URL cannot be empty".to_string()));
        }

        self.repo.set_setting(API_BASE_URL_KEY, url).await?;
        tracing::info!("API base URL set to {}", url);
        Ok(())
    }

    pub async fn get_device_token(&self) -> Result<String> {
        device_token(&self.repo).await
    }

    /// Store the device token from pairing or manual entry
    pub async fn set_device_token(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::Validation("Device token cannot be empty".to_string()));
        }

        self.repo.set_setting(DEVICE_TOKEN_KEY, token).await?;
        tracing::info!("Device token updated");
        Ok(())
    }

    /// Public overlay URL for sharing
    pub async fn overlay_url(&self) -> Result<String> {
        let base = self.get_api_base_url().await?;
        Ok(format!("{}/overlay", base.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use tempfile::TempDir;

    async fn create_test_service() -> (SettingsService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::new(memory_pool().await);
        let service = SettingsService::new(temp_dir.path().to_path_buf(), repo);
        (service, temp_dir)
    }

    #[tokio::test]
    async fn test_default_settings_created_on_load() {
        let (service, temp) = create_test_service().await;

        let settings = service.load().await.unwrap();

        assert_eq!(settings.sync.interval_secs, 30);
        assert_eq!(settings.sync.outbox_batch_limit, 50);
        assert_eq!(settings.sync.ping_batch_limit, 100);
        assert_eq!(settings.sync.max_outbox_retries, 10);
        assert_eq!(settings.api.max_attempts, 3);
        assert_eq!(settings.tracker.shift_summary_delay_secs, 5);
        assert!(temp.path().join("settings.json").exists());
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let (service, temp) = create_test_service().await;
        std::fs::write(
            temp.path().join("settings.json"),
            r#"{"sync": {"interval_secs": 10}}"#,
        )
        .unwrap();

        let settings = service.load().await.unwrap();

        assert_eq!(settings.sync.interval_secs, 10);
        assert_eq!(settings.sync.outbox_batch_limit, 50);
        assert_eq!(settings.tracking, TrackingSettings::default());
    }

    #[tokio::test]
    async fn test_settings_persistence() {
        let (service, _temp) = create_test_service().await;
        let mut settings = service.load().await.unwrap();
        settings.api.base_backoff_ms = 250;
        service.save(&settings).await.unwrap();

        let loaded = service.load().await.unwrap();
        assert_eq!(loaded.api.base_backoff_ms, 250);
    }

    #[tokio::test]
    async fn test_credentials_missing_then_set() {
        let (service, _temp) = create_test_service().await;

        let err = service.get_device_token().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Device token not set. Please pair with server first."
        );

        service.set_device_token(" abc123 ").await.unwrap();
        assert_eq!(service.get_device_token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn test_overlay_url_trims_trailing_slash() {
        let (service, _temp) = create_test_service().await;

        service
            .set_api_base_url("https://tracker.example.com/")
            .await
            .unwrap();

        assert_eq!(
            service.get_api_base_url().await.unwrap(),
            "https://tracker.example.com"
        );
        assert_eq!(
            service.overlay_url().await.unwrap(),
            "https://tracker.example.com/overlay"
        );
    }
}
