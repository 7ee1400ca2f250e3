// src/io/serial/classifier.rs
//
// Maps a received line to what the sensor meant by it. The device protocol
// is plain English, so matching is by case-insensitive substring.

use super::framer::CALIBRATION_MARKER;

/// What a line from the sensor means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    CalibrationStart,
    SensorActive,
    MotionStart,
    MotionEnd,
    /// Anything else, with the line as received
    System(String),
}

/// Marker rules, checked in order. The first hit decides the kind.
const RULES: &[(&str, MessageKind)] = &[
    (CALIBRATION_MARKER, MessageKind::CalibrationStart),
    ("sensor active", MessageKind::SensorActive),
    ("motion detected", MessageKind::MotionStart),
    ("motion ended", MessageKind::MotionEnd),
];

/// Classify one trimmed line. A line never yields more than one kind.
pub fn classify(line: &str) -> MessageKind {
    let lower = line.to_lowercase();
    RULES
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, kind)| kind.clone())
        .unwrap_or_else(|| MessageKind::System(line.to_string()))
}
