// src/event_store.rs
//
// Persistent store for motion events. The connection pipeline only needs the
// `EventSink` contract; `SqliteEventStore` is the production implementation.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, SubsecRound, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY,
    event_type TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    duration REAL
);

CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events (event_type, timestamp_us);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events (timestamp_us);
";

const MICROS_PER_DAY: i64 = 86_400_000_000;

// ============================================================================
// Types
// ============================================================================

/// Kind of event produced by the sensor pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    System,
    MotionStart,
    MotionEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::System => "system",
            EventKind::MotionStart => "motion_start",
            EventKind::MotionEnd => "motion_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(EventKind::System),
            "motion_start" => Some(EventKind::MotionStart),
            "motion_end" => Some(EventKind::MotionEnd),
            _ => None,
        }
    }
}

/// A persisted event. `id` is only known once the store has written it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub id: Option<i64>,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds, only set for a motion end that had a recorded start
    pub duration: Option<f64>,
}

impl Event {
    /// The timestamp is cut to microseconds, the precision the store keeps.
    pub fn new(kind: EventKind, message: impl Into<String>, timestamp: DateTime<Utc>, duration: Option<f64>) -> Self {
        Self {
            id: None,
            kind,
            message: message.into(),
            timestamp: timestamp.trunc_subsecs(6),
            duration,
        }
    }
}

/// Sink contract used by the connection pipeline and the control surface.
pub trait EventSink: Send + Sync {
    fn append(&self, event: &Event) -> Result<(), String>;

    /// Most recent events first
    fn query_recent(&self, limit: usize) -> Result<Vec<Event>, String>;

    /// Count events of `kind`, optionally restricted to one local calendar day
    fn count_by_kind(&self, kind: EventKind, date: Option<NaiveDate>) -> Result<u64, String>;

    fn latest(&self) -> Result<Option<Event>, String>;

    /// Delete every event. Returns the number of rows removed.
    fn clear_all(&self) -> Result<usize, String>;
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed event store.
/// rusqlite::Connection is !Sync, so it sits behind a Mutex.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) the database file at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create event database dir: {}", e))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| format!("Failed to open event database: {}", e))?;

        // WAL mode so status queries don't block the pump's writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| format!("Failed to set WAL mode: {}", e))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(|e| format!("Failed to set synchronous mode: {}", e))?;

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("Failed to create schema: {}", e))?;

        tlog!("[event_store] Opened at {:?}", db_path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, discarded when the store is dropped.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory event database: {}", e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("Failed to create schema: {}", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, String> {
        self.conn
            .lock()
            .map_err(|e| format!("Event database lock poisoned: {}", e))
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let kind: String = row.get("event_type")?;
    let timestamp_us: i64 = row.get("timestamp_us")?;

    Ok(Event {
        id: Some(row.get("id")?),
        // Unknown kinds can only come from a foreign writer; surface them as system
        kind: EventKind::parse(&kind).unwrap_or(EventKind::System),
        message: row.get("message")?,
        timestamp: DateTime::<Utc>::from_timestamp_micros(timestamp_us).unwrap_or_default(),
        duration: row.get("duration")?,
    })
}

/// Start and end (exclusive) of a local calendar day, in UTC microseconds.
fn local_day_bounds_us(date: NaiveDate) -> (i64, i64) {
    let midnight = |d: NaiveDate| {
        let naive = d.and_time(NaiveTime::MIN);
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_micros())
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive).timestamp_micros())
    };

    let start = midnight(date);
    let end = date
        .succ_opt()
        .map(midnight)
        .unwrap_or(start + MICROS_PER_DAY);
    (start, end)
}

impl EventSink for SqliteEventStore {
    fn append(&self, event: &Event) -> Result<(), String> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (event_type, message, timestamp_us, duration) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.kind.as_str(),
                event.message,
                event.timestamp.timestamp_micros(),
                event.duration
            ],
        )
        .map_err(|e| format!("Failed to insert event: {}", e))?;
        Ok(())
    }

    fn query_recent(&self, limit: usize) -> Result<Vec<Event>, String> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, event_type, message, timestamp_us, duration FROM events
                 ORDER BY timestamp_us DESC, id DESC LIMIT ?1",
            )
            .map_err(|e| format!("Failed to prepare query: {}", e))?;

        let rows = stmt
            .query_map(params![limit as i64], row_to_event)
            .map_err(|e| format!("Failed to query events: {}", e))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read event row: {}", e))
    }

    fn count_by_kind(&self, kind: EventKind, date: Option<NaiveDate>) -> Result<u64, String> {
        let conn = self.lock()?;
        let count: i64 = match date {
            Some(date) => {
                let (start, end) = local_day_bounds_us(date);
                conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE event_type = ?1 AND timestamp_us >= ?2 AND timestamp_us < ?3",
                    params![kind.as_str(), start, end],
                    |row| row.get(0),
                )
            }
            None => conn.query_row(
                "SELECT COUNT(*) FROM events WHERE event_type = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            ),
        }
        .map_err(|e| format!("Failed to count events: {}", e))?;

        Ok(count.max(0) as u64)
    }

    fn latest(&self) -> Result<Option<Event>, String> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, event_type, message, timestamp_us, duration FROM events
             ORDER BY timestamp_us DESC, id DESC LIMIT 1",
            [],
            row_to_event,
        )
        .optional()
        .map_err(|e| format!("Failed to query latest event: {}", e))
    }

    fn clear_all(&self) -> Result<usize, String> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM events", [])
            .map_err(|e| format!("Failed to clear events: {}", e))?;
        tlog!("[event_store] Cleared {} events", removed);
        Ok(removed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_secs: i64) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(offset_secs)
    }

    #[test]
    fn test_event_kind_names() {
        for kind in [EventKind::System, EventKind::MotionStart, EventKind::MotionEnd] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn test_query_recent_newest_first() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.append(&Event::new(EventKind::MotionStart, "Motion detected!", at(-20), None)).unwrap();
        store.append(&Event::new(EventKind::MotionEnd, "Motion ended!", at(-10), Some(10.0))).unwrap();
        store.append(&Event::new(EventKind::MotionStart, "Motion detected!", at(0), None)).unwrap();

        let events = store.query_recent(50).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::MotionStart);
        assert_eq!(events[1].kind, EventKind::MotionEnd);
        assert_eq!(events[1].duration, Some(10.0));
        assert!(events.iter().all(|e| e.id.is_some()));

        let limited = store.query_recent(1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, events[0].id);
    }

    #[test]
    fn test_timestamp_keeps_microseconds() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let ts = DateTime::<Utc>::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        store.append(&Event::new(EventKind::MotionStart, "m", ts, None)).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().timestamp, ts);
    }

    #[test]
    fn test_nanosecond_timestamp_reads_back_equal() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let event = Event::new(EventKind::MotionEnd, "Motion ended!", ts, Some(0.5));
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 123_456_000);

        store.append(&event).unwrap();
        let stored = store.latest().unwrap().unwrap();
        assert_eq!(stored.timestamp, event.timestamp);
        assert_eq!(Event { id: None, ..stored }, event);
    }

    #[test]
    fn test_count_by_kind_with_date_filter() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.append(&Event::new(EventKind::MotionStart, "a", now, None)).unwrap();
        store.append(&Event::new(EventKind::MotionStart, "b", now - Duration::days(3), None)).unwrap();
        store.append(&Event::new(EventKind::MotionEnd, "c", now, Some(1.5))).unwrap();

        assert_eq!(store.count_by_kind(EventKind::MotionStart, None).unwrap(), 2);
        assert_eq!(store.count_by_kind(EventKind::MotionEnd, None).unwrap(), 1);

        let today = now.with_timezone(&Local).date_naive();
        assert_eq!(store.count_by_kind(EventKind::MotionStart, Some(today)).unwrap(), 1);
    }

    #[test]
    fn test_latest_and_clear() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        assert!(store.latest().unwrap().is_none());

        store.append(&Event::new(EventKind::MotionStart, "first", at(-5), None)).unwrap();
        store.append(&Event::new(EventKind::MotionEnd, "second", at(0), None)).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().message, "second");

        assert_eq!(store.clear_all().unwrap(), 2);
        assert!(store.query_recent(10).unwrap().is_empty());
        assert_eq!(store.count_by_kind(EventKind::MotionStart, None).unwrap(), 0);
    }

    #[test]
    fn test_local_day_bounds_span_one_day() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let (start, end) = local_day_bounds_us(date);
        // 23 or 25 hours on DST transitions, otherwise exactly one day
        assert!(end - start >= MICROS_PER_DAY - 3_600_000_000);
        assert!(end - start <= MICROS_PER_DAY + 3_600_000_000);
    }
}
