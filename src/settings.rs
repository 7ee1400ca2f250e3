// src/settings.rs
//
// Persisted application settings. Stored as pretty JSON; every field has a
// serde default so older or hand-edited files keep loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR_NAME: &str = "intrusion-monitor";

/// Delays and timeouts used by the connection manager, in milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConnectionTimings {
    /// Pause after closing a previous session before reopening
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Pause after opening the port while the board resets
    #[serde(default = "default_device_reset_delay_ms")]
    pub device_reset_delay_ms: u64,
    /// Pump sleep between drains of the port
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl ConnectionTimings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn device_reset_delay(&self) -> Duration {
        Duration::from_millis(self.device_reset_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Zero delays, used by tests that drive the manager with scripted streams.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            settle_delay_ms: 0,
            device_reset_delay_ms: 0,
            poll_interval_ms: 1,
            read_timeout_ms: 10,
            write_timeout_ms: 10,
        }
    }
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            device_reset_delay_ms: default_device_reset_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    #[serde(default = "default_port")]
    pub default_port: String,
    #[serde(default = "default_baud_rate")]
    pub default_baud_rate: u32,
    /// SQLite event database. `None` resolves to the platform data dir.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Directory for log files. `None` disables file logging.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Length of the sensor's warm-up phase; one dot is printed per second
    #[serde(default = "default_calibration_seconds")]
    pub calibration_seconds: u32,
    #[serde(default = "default_recent_events_limit")]
    pub recent_events_limit: usize,
    /// Per-consumer queue depth for the notification broadcast
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
    #[serde(default)]
    pub timings: ConnectionTimings,
}

fn default_port() -> String {
    "COM10".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_calibration_seconds() -> u32 {
    30
}
fn default_recent_events_limit() -> usize {
    50
}
fn default_notification_capacity() -> usize {
    256
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_device_reset_delay_ms() -> u64 {
    2000 // Arduino auto-reset on DTR
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_write_timeout_ms() -> u64 {
    1000
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            default_baud_rate: default_baud_rate(),
            database_path: None,
            log_dir: None,
            calibration_seconds: default_calibration_seconds(),
            recent_events_limit: default_recent_events_limit(),
            notification_capacity: default_notification_capacity(),
            timings: ConnectionTimings::default(),
        }
    }
}

impl AppSettings {
    /// Resolve the event database location, falling back to the platform data dir.
    pub fn resolved_database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
                .join("intrusion.db"),
        }
    }
}

/// Default settings file location: `<config dir>/intrusion-monitor/settings.json`.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("settings.json")
}

/// Load settings from `path`. On first run the defaults are written out.
pub fn load_settings(path: &Path) -> Result<AppSettings, String> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
    } else {
        let settings = AppSettings::default();
        save_settings(path, &settings)?;
        tlog!("[settings] Wrote default settings to {:?}", path);
        Ok(settings)
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}
