// src/io/serial/calibration.rs
//
// Progress tracking for the sensor's warm-up phase. The sensor prints
// "Calibrating sensor" followed by one dot per second of warm-up.

use chrono::{DateTime, Utc};

use crate::notify::CalibrationProgress;

/// Default warm-up length of the PIR sensor firmware, in seconds
pub const DEFAULT_CALIBRATION_SECONDS: u32 = 30;

pub struct CalibrationTracker {
    total_seconds: u32,
    started_at: Option<DateTime<Utc>>,
    dots_received: u32,
}

impl Default for CalibrationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CALIBRATION_SECONDS)
    }
}

impl CalibrationTracker {
    pub fn new(total_seconds: u32) -> Self {
        Self {
            total_seconds,
            started_at: None,
            dots_received: 0,
        }
    }

    pub fn total_seconds(&self) -> u32 {
        self.total_seconds
    }

    pub fn dots_received(&self) -> u32 {
        self.dots_received
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Count one dot and report the new progress.
    /// Counting is driven by the framer seeing the marker on the current
    /// line, not by `started_at`.
    pub fn on_dot(&mut self) -> CalibrationProgress {
        self.dots_received = self.dots_received.saturating_add(1);
        CalibrationProgress {
            progress: self.progress(),
            remaining: self.total_seconds.saturating_sub(self.dots_received),
            active: true,
            dots: Some(self.dots_received),
        }
    }

    pub fn on_calibration_start(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.dots_received = 0;
    }

    /// Terminal notification once the sensor reports it is armed
    pub fn on_sensor_active(&self) -> CalibrationProgress {
        CalibrationProgress {
            progress: 100.0,
            remaining: 0,
            active: false,
            dots: None,
        }
    }

    /// Reset and report zero progress for a closed connection
    pub fn on_disconnect(&mut self) -> CalibrationProgress {
        self.started_at = None;
        self.dots_received = 0;
        idle_progress(self.total_seconds)
    }

    fn progress(&self) -> f64 {
        if self.total_seconds == 0 {
            return 100.0;
        }
        (self.dots_received as f64 / self.total_seconds as f64 * 100.0).min(100.0)
    }
}

/// Progress reported while no calibration is running
pub fn idle_progress(total_seconds: u32) -> CalibrationProgress {
    CalibrationProgress {
        progress: 0.0,
        remaining: total_seconds,
        active: false,
        dots: None,
    }
}
