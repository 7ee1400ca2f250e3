// src/logging.rs
//
// Timestamped stderr logging with an optional mirror to a log file.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Mirror target for `tlog!`. `None` until `init_file_logging` succeeds.
static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

const LOG_LINK_NAME: &str = "intrusion-monitor.log";

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Write one already-formatted message. Used by `tlog!`.
pub(crate) fn write_line(message: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", stamp(), message);
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Start mirroring log lines into a new timestamped file under `log_dir`.
/// On Unix an `intrusion-monitor.log` symlink is pointed at the newest file.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create log dir: {}", e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-intrusion-monitor.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LOG_LINK_NAME);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            write_line(format_args!("[logging] Failed to link {}: {}", LOG_LINK_NAME, e));
        }
    }

    match LOG_FILE.lock() {
        Ok(mut guard) => *guard = Some(file),
        Err(e) => return Err(format!("Failed to install log file: {}", e)),
    }

    write_line(format_args!("[logging] Mirroring to {}", log_path.display()));
    Ok(log_path)
}

/// Stop mirroring and close the log file. Safe to call when logging never started.
pub fn stop_file_logging() {
    let closed = LOG_FILE
        .lock()
        .map(|mut guard| guard.take().is_some())
        .unwrap_or(false);
    if closed {
        write_line(format_args!("[logging] File logging stopped"));
    }
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time; also goes to the log file when enabled.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(format_args!($($arg)*))
    };
}
