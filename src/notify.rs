// src/notify.rs
//
// Consumer fan-out. Every notification goes to every subscriber currently
// attached; publishing never blocks and never fails.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::event_store::EventKind;

// ============================================================================
// Payload Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Calibrating,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionStatus {
    Detected,
    Ended,
}

/// Calibration progress as reported to consumers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationProgress {
    /// Percentage, 0..=100
    pub progress: f64,
    /// Seconds of calibration left
    pub remaining: u32,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dots: Option<u32>,
}

/// Every notification a consumer can receive.
/// Serialized as `{"event": "<name>", "payload": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    SerialStatus {
        status: LinkStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<String>,
    },
    SerialError {
        error: String,
    },
    /// One received line, trimmed
    SerialData {
        message: String,
        timestamp: String,
    },
    SensorStatus {
        status: SensorStatus,
    },
    CalibrationProgress(CalibrationProgress),
    MotionStatus {
        status: MotionStatus,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    MotionAlert {
        #[serde(rename = "type")]
        alert_type: MotionStatus,
        timestamp: String,
        message: String,
    },
    /// Human-readable activity log entry
    LogUpdate {
        #[serde(rename = "type")]
        kind: EventKind,
        message: String,
        timestamp: DateTime<Local>,
        duration: Option<f64>,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::SerialStatus { .. } => "serial_status",
            Notification::SerialError { .. } => "serial_error",
            Notification::SerialData { .. } => "serial_data",
            Notification::SensorStatus { .. } => "sensor_status",
            Notification::CalibrationProgress(_) => "calibration_progress",
            Notification::MotionStatus { .. } => "motion_status",
            Notification::MotionAlert { .. } => "motion_alert",
            Notification::LogUpdate { .. } => "log_update",
        }
    }
}

/// Wall-clock `HH:MM:SS` used by the short-form timestamps
pub fn clock_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

// ============================================================================
// Notifier
// ============================================================================

/// Broadcast handle shared by the connection manager and its pump.
/// Slow subscribers lag and lose their oldest notifications instead of
/// holding up the publisher.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fire-and-forget. Having no subscribers is not an error.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// Publish a `log_update` entry stamped with the current local time
    pub fn log(&self, kind: EventKind, message: impl Into<String>, duration: Option<f64>) {
        self.publish(Notification::LogUpdate {
            kind,
            message: message.into(),
            timestamp: Local::now(),
            duration,
        });
    }
}
