#[macro_use]
mod logging;

pub mod commands;
pub mod event_store;
pub mod io;
pub mod notify;
pub mod settings;

use std::path::Path;
use std::sync::Arc;

pub use logging::{init_file_logging, stop_file_logging};

use event_store::SqliteEventStore;
use io::serial::SerialPortOpener;
use io::ConnectionManager;
use notify::Notifier;
use settings::AppSettings;

// ============================================================================
// Application State
// ============================================================================

/// Everything the control surface needs: the loaded settings and the single
/// connection manager that owns the sensor link.
pub struct AppState {
    pub settings: AppSettings,
    pub manager: ConnectionManager,
}

impl AppState {
    /// Wire up the event database, notification fan-out and real serial
    /// ports from `settings`.
    pub fn from_settings(settings: AppSettings) -> Result<Self, String> {
        if let Some(dir) = &settings.log_dir {
            if let Err(e) = logging::init_file_logging(Path::new(dir)) {
                eprintln!("[setup] Failed to start file logging: {}", e);
            }
        }

        let store = SqliteEventStore::open(&settings.resolved_database_path())?;
        let manager = ConnectionManager::new(
            Arc::new(SerialPortOpener),
            Arc::new(store),
            Notifier::new(settings.notification_capacity),
            settings.timings.clone(),
            settings.calibration_seconds,
        );

        tlog!(
            "[setup] Ready (default port {} at {} baud)",
            settings.default_port,
            settings.default_baud_rate
        );

        Ok(Self { settings, manager })
    }
}

/// Load settings from `settings_path` (or the default location) and build the app.
pub fn init(settings_path: Option<&Path>) -> Result<AppState, String> {
    let path = match settings_path {
        Some(p) => p.to_path_buf(),
        None => settings::default_settings_path(),
    };
    let settings = settings::load_settings(&path)?;
    AppState::from_settings(settings)
}
