// src/io/serial/motion.rs
//
// Motion episode tracking: Idle until "motion detected", Active until
// "motion ended". Only one episode is tracked at a time.

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct MotionTracker {
    started_at: Option<DateTime<Utc>>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Begin an episode. A second start while active replaces the start time.
    pub fn on_motion_start(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
    }

    /// End the current episode and return its length in seconds.
    /// An end without a recorded start is tolerated and has no duration.
    /// A wall clock stepped backwards mid-episode gives zero, never negative.
    pub fn on_motion_end(&mut self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at.take().map(|start| {
            let micros = (now - start).num_microseconds().unwrap_or(i64::MAX);
            (micros as f64 / 1_000_000.0).max(0.0)
        })
    }

    pub fn reset(&mut self) {
        self.started_at = None;
    }
}
