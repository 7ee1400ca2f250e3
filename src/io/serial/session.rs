// src/io/serial/session.rs
//
// Per-connection state: line buffer, calibration progress and the current
// motion episode. Turns framed input into notifications and stored events.
//
// Notifications for one line go out in a fixed order:
// serial_data -> status -> (store write) -> log_update [-> motion_alert]

use chrono::{DateTime, Utc};

use super::calibration::CalibrationTracker;
use super::classifier::{classify, MessageKind};
use super::framer::{FramedItem, LineFramer};
use super::motion::MotionTracker;
use crate::event_store::{Event, EventKind, EventSink};
use crate::notify::{clock_time, CalibrationProgress, MotionStatus, Notification, Notifier, SensorStatus};

pub struct ConnectionSession {
    id: String,
    port: String,
    framer: LineFramer,
    calibration: CalibrationTracker,
    motion: MotionTracker,
}

impl ConnectionSession {
    pub fn new(id: impl Into<String>, port: impl Into<String>, calibration_seconds: u32) -> Self {
        Self {
            id: id.into(),
            port: port.into(),
            framer: LineFramer::new(),
            calibration: CalibrationTracker::new(calibration_seconds),
            motion: MotionTracker::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn calibration(&self) -> &CalibrationTracker {
        &self.calibration
    }

    pub fn motion(&self) -> &MotionTracker {
        &self.motion
    }

    /// Run freshly read bytes through the framer and act on everything it produced.
    pub fn ingest(&mut self, data: &[u8], sink: &dyn EventSink, notifier: &Notifier) {
        for item in self.framer.feed(data) {
            match item {
                FramedItem::CalibrationDot => {
                    let progress = self.calibration.on_dot();
                    notifier.publish(Notification::CalibrationProgress(progress));
                }
                FramedItem::Line { text, raw } => {
                    tlog!("[serial:{}] RX {:?}", self.id, raw);
                    self.handle_line(&text, Utc::now(), sink, notifier);
                }
            }
        }
    }

    /// Act on one complete, trimmed line received at `now`.
    pub fn handle_line(&mut self, line: &str, now: DateTime<Utc>, sink: &dyn EventSink, notifier: &Notifier) {
        notifier.publish(Notification::SerialData {
            message: line.to_string(),
            timestamp: clock_time(now),
        });

        match classify(line) {
            MessageKind::CalibrationStart => {
                tlog!("[serial:{}] Sensor calibration started", self.id);
                self.calibration.on_calibration_start(now);
                notifier.publish(Notification::SensorStatus {
                    status: SensorStatus::Calibrating,
                });
                notifier.log(EventKind::System, "Sensor calibration started...", None);
            }
            MessageKind::SensorActive => {
                tlog!("[serial:{}] Sensor active", self.id);
                notifier.publish(Notification::SensorStatus {
                    status: SensorStatus::Active,
                });
                notifier.publish(Notification::CalibrationProgress(self.calibration.on_sensor_active()));
                notifier.log(EventKind::System, "Sensor active and armed - ready for detection", None);
            }
            MessageKind::MotionStart => {
                tlog!("[serial:{}] Motion start", self.id);
                notifier.publish(Notification::MotionStatus {
                    status: MotionStatus::Detected,
                    message: line.to_string(),
                    duration: None,
                });
                self.motion.on_motion_start(now);
                self.persist(sink, Event::new(EventKind::MotionStart, line, now, None));
                notifier.log(EventKind::MotionStart, "MOTION DETECTED!", None);
                notifier.publish(Notification::MotionAlert {
                    alert_type: MotionStatus::Detected,
                    timestamp: clock_time(now),
                    message: "Motion detected!".to_string(),
                });
            }
            MessageKind::MotionEnd => {
                let duration = self.motion.on_motion_end(now);
                tlog!("[serial:{}] Motion end (duration: {:?})", self.id, duration);
                notifier.publish(Notification::MotionStatus {
                    status: MotionStatus::Ended,
                    message: line.to_string(),
                    duration,
                });
                self.persist(sink, Event::new(EventKind::MotionEnd, line, now, duration));
                let message = match duration {
                    Some(secs) => format!("Motion ended (Duration: {:.1}s)", secs),
                    None => "Motion ended".to_string(),
                };
                notifier.log(EventKind::MotionEnd, message, duration);
            }
            MessageKind::System(text) => {
                notifier.log(EventKind::System, format!("Sensor: {}", text), None);
            }
        }
    }

    /// Drop in-progress state for a closed connection.
    /// Returns the zeroed calibration progress to publish.
    pub fn close(&mut self) -> CalibrationProgress {
        self.motion.reset();
        if let Some(partial) = self.framer.flush() {
            tlog!("[serial:{}] Discarding partial line {:?}", self.id, partial);
        }
        self.calibration.on_disconnect()
    }

    // A failed write must not stop the pump
    fn persist(&self, sink: &dyn EventSink, event: Event) {
        if let Err(e) = sink.append(&event) {
            tlog!(
                "[serial:{}] Failed to store {} event: {}",
                self.id,
                event.kind.as_str(),
                e
            );
        }
    }
}
