// src/io/serial/framer.rs
//
// Line framing for the sensor's text protocol. Lines end in `\n`, `\r` or
// both. While a line is still arriving, each `.` on a calibration line is
// reported straight away so progress is visible before the line completes.

/// Marker the sensor prints at the start of its warm-up phase
pub const CALIBRATION_MARKER: &str = "calibrating sensor";

/// Longest unterminated line kept. Older text is dropped past this.
pub const MAX_LINE_LEN: usize = 1024;

/// Output of the framer, in stream order
#[derive(Debug, Clone, PartialEq)]
pub enum FramedItem {
    /// A `.` arrived on an in-progress calibration line
    CalibrationDot,
    /// A complete, non-empty line
    Line {
        /// Whitespace-trimmed text
        text: String,
        /// Text as received, including the terminator
        raw: String,
    },
}

/// Stateful line framer for streaming data.
pub struct LineFramer {
    buffer: String,
    /// The calibration marker has been seen on the current line
    marker_seen: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            buffer: String::with_capacity(128),
            marker_seen: false,
        }
    }

    /// Feed raw bytes into the framer.
    /// Bytes outside ASCII are dropped, so output does not depend on how the
    /// stream was split into reads.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FramedItem> {
        let mut items = Vec::new();

        for &byte in data {
            if !byte.is_ascii() {
                continue;
            }
            let ch = byte as char;
            if self.buffer.len() >= MAX_LINE_LEN {
                self.buffer.clear();
            }
            self.buffer.push(ch);

            match ch {
                '\n' | '\r' => {
                    let text = self.buffer.trim();
                    if !text.is_empty() {
                        items.push(FramedItem::Line {
                            text: text.to_string(),
                            raw: self.buffer.clone(),
                        });
                    }
                    self.buffer.clear();
                    self.marker_seen = false;
                }
                '.' if self.marker_seen => {
                    items.push(FramedItem::CalibrationDot);
                }
                _ => {
                    if !self.marker_seen && ends_with_marker(&self.buffer) {
                        self.marker_seen = true;
                    }
                }
            }
        }

        items
    }

    /// Text received since the last terminator
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Take any unterminated remainder. Returns None if it is blank.
    pub fn flush(&mut self) -> Option<String> {
        let text = self.buffer.trim().to_string();
        self.buffer.clear();
        self.marker_seen = false;
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

// The buffer only ever holds ASCII, so any byte offset is a char boundary
fn ends_with_marker(buffer: &str) -> bool {
    buffer.len() >= CALIBRATION_MARKER.len()
        && buffer[buffer.len() - CALIBRATION_MARKER.len()..].eq_ignore_ascii_case(CALIBRATION_MARKER)
}
