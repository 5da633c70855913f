//! Configuration types for the offline worker.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Offline cache settings.
    pub cache: CacheConfig,
    /// Reminder scheduling and notification settings.
    pub alarms: AlarmConfig,
    /// Host bridge channel sizing.
    pub host: HostConfig,
}

/// Where cached responses live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process memory only; lost on restart.
    #[default]
    Memory,
    /// JSON files under [`CacheConfig::disk_dir`].
    Disk,
}

/// Offline cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix shared by every bucket name (`{prefix}-static-{version}`).
    pub name_prefix: String,
    /// Current generation tag. Bumping it on deploy invalidates every cached entry.
    pub version: String,
    /// Origin whose same-origin GET requests are intercepted.
    pub origin: String,
    /// Path fragment marking data requests (network-first).
    pub api_prefix: String,
    /// Cached page served to navigations when both cache and network miss.
    pub offline_page: String,
    /// Paths fetched into the static bucket at install time.
    pub static_assets: Vec<String>,
    /// Storage backend for cached responses.
    pub backend: BackendKind,
    /// Directory for the disk backend.
    pub disk_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name_prefix: "meu-remedio".to_owned(),
            version: "v3.0.1".to_owned(),
            origin: "http://localhost:8080".to_owned(),
            api_prefix: "/api/".to_owned(),
            offline_page: "/".to_owned(),
            static_assets: [
                "/",
                "/index.html",
                "/manifest.json",
                "/icon-72.png",
                "/icon-96.png",
                "/icon-128.png",
                "/icon-144.png",
                "/icon-152.png",
                "/icon-192.png",
                "/icon-384.png",
                "/icon-512.png",
                "/shortcut-med.png",
                "/shortcut-take.png",
                "/shortcut-consult.png",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
            backend: BackendKind::Memory,
            disk_dir: default_cache_dir(),
        }
    }
}

/// Reminder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Alarms further out than this are rejected; the app re-submits them later.
    pub horizon_hours: u32,
    /// Snooze delay used when an action does not carry one.
    pub default_snooze_minutes: u32,
    /// Fired-alarm acknowledgement records kept in memory.
    pub history_limit: usize,
    /// Cancelling an alarm also cancels its pending snoozed copy.
    pub cancel_cascades_to_snooze: bool,
    /// Vibration pattern in milliseconds (best effort).
    pub vibration: Vec<u32>,
    /// Notification icon path.
    pub icon: String,
    /// Notification badge path.
    pub badge: String,
    /// Keep notifications on screen until the user reacts.
    pub require_interaction: bool,
    /// Title used when a push payload carries none.
    pub app_title: String,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 24 * 7,
            default_snooze_minutes: 10,
            history_limit: 200,
            cancel_cascades_to_snooze: false,
            vibration: vec![200, 100, 200],
            icon: "/icon-192.png".to_owned(),
            badge: "/icon-72.png".to_owned(),
            require_interaction: true,
            app_title: "Meu Remédio".to_owned(),
        }
    }
}

impl AlarmConfig {
    /// Scheduling horizon as a chrono duration.
    #[must_use]
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.horizon_hours))
    }
}

/// Host bridge channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Inbound event queue capacity.
    pub request_capacity: usize,
    /// Outbound broadcast capacity.
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            event_capacity: 128,
        }
    }
}

/// Returns the default disk cache directory.
fn default_cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("REMEDIO_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("remedio"))
        .unwrap_or_else(|| PathBuf::from("/tmp/remedio-cache"))
}

impl WorkerConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::WorkerError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::WorkerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/remedio/config.toml`.
    ///
    /// `REMEDIO_CONFIG_DIR` overrides the directory.
    pub fn default_config_path() -> PathBuf {
        if let Some(dir) = std::env::var_os("REMEDIO_CONFIG_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("remedio").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("/tmp/remedio-config/config.toml"))
    }

    /// Check values the engines cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WorkerError::Config`] describing the first bad field.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::WorkerError;

        if self.cache.version.trim().is_empty() {
            return Err(WorkerError::Config("cache.version cannot be empty".to_owned()));
        }
        if self.cache.name_prefix.trim().is_empty() {
            return Err(WorkerError::Config(
                "cache.name_prefix cannot be empty".to_owned(),
            ));
        }
        url::Url::parse(&self.cache.origin)
            .map_err(|e| WorkerError::Config(format!("cache.origin is not a URL: {e}")))?;
        if self.alarms.horizon_hours == 0 {
            return Err(WorkerError::Config(
                "alarms.horizon_hours must be positive".to_owned(),
            ));
        }
        if self.alarms.default_snooze_minutes == 0 {
            return Err(WorkerError::Config(
                "alarms.default_snooze_minutes must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.static_assets.len(), 14);
        assert_eq!(config.alarms.vibration, vec![200, 100, 200]);
        assert_eq!(config.alarms.default_snooze_minutes, 10);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = WorkerConfig::default();
        config.cache.version = "v4".to_owned();
        config.alarms.horizon_hours = 48;
        config.cache.backend = BackendKind::Disk;

        config.save_to_file(&path).unwrap();
        let loaded = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.cache.version, "v4");
        assert_eq!(loaded.alarms.horizon_hours, 48);
        assert_eq!(loaded.cache.backend, BackendKind::Disk);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: WorkerConfig = toml::from_str("[cache]\nversion = \"v9\"\n").unwrap();
        assert_eq!(config.cache.version, "v9");
        assert_eq!(config.cache.name_prefix, "meu-remedio");
        assert_eq!(config.host.request_capacity, 64);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(WorkerConfig::from_file(&path).is_err());
    }

    #[test]
    fn validate_rejects_bad_origin_and_zero_horizon() {
        let mut config = WorkerConfig::default();
        config.cache.origin = "not a url".to_owned();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.alarms.horizon_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = WorkerConfig::default_config_path();
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
