// src/io/serial/reader.rs
//
// Connection manager for the sensor link. Owns the open stream, runs the
// read pump on a blocking worker and reports link state to consumers.
// Only one session exists at a time; connecting again replaces it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::calibration::idle_progress;
use super::port::{DuplexStream, SerialPortInfo, StreamOpener, StreamTimeouts};
use super::session::ConnectionSession;
use crate::event_store::{EventKind, EventSink};
use crate::notify::{LinkStatus, Notification, Notifier};
use crate::settings::ConnectionTimings;

// ============================================================================
// Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of the link for status queries
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub port: Option<String>,
    pub session_id: Option<String>,
    /// Whether the pump is still reading
    pub reading: bool,
    pub calibration_dots: u32,
    pub calibration_started_at: Option<DateTime<Utc>>,
    pub motion_active: bool,
    pub motion_started_at: Option<DateTime<Utc>>,
}

type SharedStream = Arc<Mutex<Option<Box<dyn DuplexStream>>>>;

/// Handles to one open session, shared between the manager and its pump
#[derive(Clone)]
struct SessionHandles {
    session: Arc<Mutex<ConnectionSession>>,
    stream: SharedStream,
    stop_flag: Arc<AtomicBool>,
}

struct ActiveSession {
    handles: SessionHandles,
    task_handle: Option<JoinHandle<()>>,
}

/// Everything the pump needs, moved onto the blocking worker
struct PumpContext {
    session_id: String,
    handles: SessionHandles,
    sink: Arc<dyn EventSink>,
    notifier: Notifier,
    reading: Arc<AtomicBool>,
    state: Arc<Mutex<ConnectionState>>,
    poll_interval: std::time::Duration,
}

// Poisoning only means a pump panicked mid-update; the data is still usable
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Connection Manager
// ============================================================================

pub struct ConnectionManager {
    opener: Arc<dyn StreamOpener>,
    sink: Arc<dyn EventSink>,
    notifier: Notifier,
    timings: ConnectionTimings,
    calibration_seconds: u32,
    /// Serializes connect/disconnect
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    /// Read side for status queries, never held across an await
    current: Mutex<Option<SessionHandles>>,
    state: Arc<Mutex<ConnectionState>>,
    reading: Arc<AtomicBool>,
    next_session: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        opener: Arc<dyn StreamOpener>,
        sink: Arc<dyn EventSink>,
        notifier: Notifier,
        timings: ConnectionTimings,
        calibration_seconds: u32,
    ) -> Self {
        Self {
            opener,
            sink,
            notifier,
            timings,
            calibration_seconds,
            active: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            reading: Arc::new(AtomicBool::new(false)),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Attach a new consumer. The current link status is re-announced so the
    /// newcomer does not have to wait for the next change.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        let rx = self.notifier.subscribe();
        let status = self.status();
        let link = match status.state {
            ConnectionState::Connected => LinkStatus::Connected,
            _ => LinkStatus::Disconnected,
        };
        self.notifier.publish(Notification::SerialStatus {
            status: link,
            port: if link == LinkStatus::Connected { status.port } else { None },
        });
        rx
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        let reading = self.reading.load(Ordering::SeqCst);
        let current = lock(&self.current).clone();

        match current {
            Some(handles) => {
                let session = lock(&handles.session);
                ConnectionStatus {
                    state,
                    port: Some(session.port().to_string()),
                    session_id: Some(session.id().to_string()),
                    reading,
                    calibration_dots: session.calibration().dots_received(),
                    calibration_started_at: session.calibration().started_at(),
                    motion_active: session.motion().is_active(),
                    motion_started_at: session.motion().started_at(),
                }
            }
            None => ConnectionStatus {
                state,
                port: None,
                session_id: None,
                reading,
                calibration_dots: 0,
                calibration_started_at: None,
                motion_active: false,
                motion_started_at: None,
            },
        }
    }

    pub fn list_ports(&self) -> Result<Vec<SerialPortInfo>, String> {
        self.opener.list_ports()
    }

    /// Open `port` and start reading. Any existing session is closed first.
    /// Returns false (after notifying consumers) if the port could not be opened.
    pub async fn connect(&self, port: &str, baud_rate: u32) -> bool {
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            self.teardown(previous).await;
            tokio::time::sleep(self.timings.settle_delay()).await;
        }

        self.set_state(ConnectionState::Connecting);
        tlog!("[serial] Attempting to connect to {} at {} baud...", port, baud_rate);

        let opener = self.opener.clone();
        let port_name = port.to_string();
        let timeouts = StreamTimeouts::from(&self.timings);
        let opened = tokio::task::spawn_blocking(move || {
            let mut stream = opener.open(&port_name, baud_rate, timeouts)?;
            if let Err(e) = stream.reset_buffers() {
                stream.close();
                return Err(e);
            }
            Ok(stream)
        })
        .await
        .map_err(|e| format!("Open task failed: {}", e))
        .and_then(|result| result);

        let stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tlog!("[serial] Connection failed: {}", error);
                self.set_state(ConnectionState::Disconnected);
                self.notifier.publish(Notification::SerialError { error: error.clone() });
                self.notifier
                    .log(EventKind::System, format!("Connection failed: {}", error), None);
                return false;
            }
        };

        // Opening the port resets the board; give it time to boot
        tokio::time::sleep(self.timings.device_reset_delay()).await;

        let session_id = format!("serial-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        let handles = SessionHandles {
            session: Arc::new(Mutex::new(ConnectionSession::new(
                session_id.clone(),
                port,
                self.calibration_seconds,
            ))),
            stream: Arc::new(Mutex::new(Some(stream))),
            stop_flag: Arc::new(AtomicBool::new(false)),
        };

        self.reading.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        *lock(&self.current) = Some(handles.clone());

        // Announced before the pump starts, so an immediate read error is
        // always reported after the connect
        tlog!("[serial:{}] Successfully connected to {}", session_id, port);
        self.notifier.publish(Notification::SerialStatus {
            status: LinkStatus::Connected,
            port: Some(port.to_string()),
        });
        self.notifier
            .log(EventKind::System, format!("Connected to sensor on {}", port), None);

        let task_handle = spawn_pump(PumpContext {
            session_id,
            handles: handles.clone(),
            sink: self.sink.clone(),
            notifier: self.notifier.clone(),
            reading: self.reading.clone(),
            state: self.state.clone(),
            poll_interval: self.timings.poll_interval(),
        });

        *active = Some(ActiveSession {
            handles,
            task_handle: Some(task_handle),
        });

        true
    }

    /// Close the link. Safe to call in any state; consumers always get the
    /// same disconnected status, zeroed calibration and log entry.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        self.reading.store(false, Ordering::SeqCst);

        let progress = match active.take() {
            Some(previous) => self.teardown(previous).await,
            None => idle_progress(self.calibration_seconds),
        };
        self.set_state(ConnectionState::Disconnected);

        self.notifier.publish(Notification::SerialStatus {
            status: LinkStatus::Disconnected,
            port: None,
        });
        self.notifier.publish(Notification::CalibrationProgress(progress));
        self.notifier
            .log(EventKind::System, "Disconnected from sensor", None);
    }

    /// Write raw bytes to the device
    pub fn send(&self, data: &[u8]) -> Result<(), String> {
        let handles = lock(&self.current)
            .clone()
            .ok_or_else(|| "Not connected".to_string())?;
        let mut stream = lock(&handles.stream);
        match stream.as_mut() {
            Some(s) => s.write(data),
            None => Err("Not connected (stream closed)".to_string()),
        }
    }

    /// Stop the pump, close the stream and reset the session's state.
    async fn teardown(&self, mut previous: ActiveSession) -> crate::notify::CalibrationProgress {
        let handles = previous.handles.clone();
        handles.stop_flag.store(true, Ordering::SeqCst);
        self.reading.store(false, Ordering::SeqCst);

        if let Some(task) = previous.task_handle.take() {
            if let Err(e) = task.await {
                tlog!("[serial] Pump task panicked: {:?}", e);
            }
        }

        if let Some(mut stream) = lock(&handles.stream).take() {
            stream.close();
        }

        *lock(&self.current) = None;

        let mut session = lock(&handles.session);
        tlog!("[serial:{}] Disconnected from {}", session.id(), session.port());
        session.close()
    }
}

// ============================================================================
// Pump
// ============================================================================

fn spawn_pump(ctx: PumpContext) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run_pump(ctx))
}

/// Blocking read loop. Drains whatever the device has sent, feeds it through
/// the session, then sleeps for the poll interval. Ends on the stop flag or
/// on a read error.
fn run_pump(ctx: PumpContext) {
    let PumpContext {
        session_id,
        handles,
        sink,
        notifier,
        reading,
        state,
        poll_interval,
    } = ctx;

    tlog!("[serial:{}] Starting reader", session_id);

    loop {
        if handles.stop_flag.load(Ordering::SeqCst) {
            break;
        }

        let read_result = match lock(&handles.stream).as_mut() {
            Some(stream) => stream.read_available(),
            None => break,
        };

        match read_result {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    lock(&handles.session).ingest(&bytes, sink.as_ref(), &notifier);
                }
            }
            Err(e) => {
                if reading.load(Ordering::SeqCst) && !handles.stop_flag.load(Ordering::SeqCst) {
                    tlog!("[serial:{}] Serial read error: {}", session_id, e);
                    notifier.log(EventKind::System, format!("Serial read error: {}", e), None);
                }
                reading.store(false, Ordering::SeqCst);
                *lock(&state) = ConnectionState::Disconnected;
                break;
            }
        }

        std::thread::sleep(poll_interval);
    }

    tlog!("[serial:{}] Reader stopped", session_id);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::SqliteEventStore;
    use crate::notify::CalibrationProgress;
    use chrono::{Local, TimeZone};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted device shared between the test and the streams it opens
    #[derive(Default)]
    struct MockDevice {
        reads: VecDeque<Result<Vec<u8>, String>>,
        written: Vec<u8>,
        opens: usize,
        closes: usize,
        fail_open: Option<String>,
    }

    #[derive(Clone, Default)]
    struct MockOpener {
        device: Arc<Mutex<MockDevice>>,
    }

    impl MockOpener {
        fn push_read(&self, data: &[u8]) {
            lock(&self.device).reads.push_back(Ok(data.to_vec()));
        }

        fn push_error(&self, error: &str) {
            lock(&self.device).reads.push_back(Err(error.to_string()));
        }
    }

    struct MockStream {
        device: Arc<Mutex<MockDevice>>,
        open: bool,
    }

    impl DuplexStream for MockStream {
        fn read_available(&mut self) -> Result<Vec<u8>, String> {
            lock(&self.device).reads.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn write(&mut self, data: &[u8]) -> Result<(), String> {
            lock(&self.device).written.extend_from_slice(data);
            Ok(())
        }

        fn reset_buffers(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                lock(&self.device).closes += 1;
            }
        }
    }

    impl StreamOpener for MockOpener {
        fn open(
            &self,
            _port: &str,
            _baud_rate: u32,
            _timeouts: StreamTimeouts,
        ) -> Result<Box<dyn DuplexStream>, String> {
            let mut device = lock(&self.device);
            if let Some(error) = device.fail_open.clone() {
                return Err(error);
            }
            device.opens += 1;
            Ok(Box::new(MockStream {
                device: self.device.clone(),
                open: true,
            }))
        }

        fn list_ports(&self) -> Result<Vec<SerialPortInfo>, String> {
            Ok(vec![SerialPortInfo {
                port_name: "/dev/ttyMOCK0".to_string(),
                port_type: "Virtual".to_string(),
                manufacturer: None,
                product: None,
                serial_number: None,
                vid: None,
                pid: None,
            }])
        }
    }

    fn manager_with(opener: &MockOpener) -> (ConnectionManager, Arc<SqliteEventStore>) {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let manager = ConnectionManager::new(
            Arc::new(opener.clone()),
            store.clone(),
            Notifier::new(512),
            ConnectionTimings::immediate(),
            30,
        );
        (manager, store)
    }

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    /// Receive until `done` matches, or fail after two seconds
    async fn recv_until(
        rx: &mut broadcast::Receiver<Notification>,
        done: impl Fn(&Notification) -> bool,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let n = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for notification")
                .expect("notification channel closed");
            let finished = done(&n);
            out.push(n);
            if finished {
                return out;
            }
        }
    }

    async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while manager.state() != state {
            assert!(tokio::time::Instant::now() < deadline, "state never became {:?}", state);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    // Log timestamps differ between otherwise identical sequences
    fn normalize(n: Notification) -> Notification {
        match n {
            Notification::LogUpdate { kind, message, duration, .. } => Notification::LogUpdate {
                kind,
                message,
                duration,
                timestamp: Local.timestamp_opt(0, 0).unwrap(),
            },
            other => other,
        }
    }

    #[tokio::test]
    async fn test_connect_announces_and_reads() {
        let opener = MockOpener::default();
        let (manager, store) = manager_with(&opener);
        let mut rx = manager.notifier().subscribe();

        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        assert_eq!(manager.state(), ConnectionState::Connected);

        let first = drain(&mut rx);
        assert_eq!(
            first[0],
            Notification::SerialStatus {
                status: LinkStatus::Connected,
                port: Some("/dev/ttyMOCK0".to_string()),
            }
        );
        match &first[1] {
            Notification::LogUpdate { kind, message, .. } => {
                assert_eq!(*kind, EventKind::System);
                assert_eq!(message, "Connected to sensor on /dev/ttyMOCK0");
            }
            other => panic!("unexpected {:?}", other),
        }

        opener.push_read(b"Motion dete");
        opener.push_read(b"cted!\r\nMotion ended!\r\n");
        recv_until(&mut rx, |n| {
            matches!(n, Notification::LogUpdate { kind: EventKind::MotionEnd, .. })
        })
        .await;

        let stored = store.query_recent(10).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].kind, EventKind::MotionEnd);
        assert!(stored[0].duration.is_some());

        let status = manager.status();
        assert_eq!(status.port.as_deref(), Some("/dev/ttyMOCK0"));
        assert!(status.reading);
        assert!(!status.motion_active);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let opener = MockOpener::default();
        lock(&opener.device).fail_open = Some("Failed to open COM99: not found".to_string());
        let (manager, _store) = manager_with(&opener);
        let mut rx = manager.notifier().subscribe();

        assert!(!manager.connect("COM99", 9600).await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let got = drain(&mut rx);
        assert_eq!(
            got[0],
            Notification::SerialError {
                error: "Failed to open COM99: not found".to_string(),
            }
        );
        match &got[1] {
            Notification::LogUpdate { message, .. } => {
                assert_eq!(message, "Connection failed: Failed to open COM99: not found")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_active_session() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);
        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);

        let mut rx = manager.notifier().subscribe();
        opener.push_read(b"Calibrating sensor...");
        recv_until(&mut rx, |n| {
            matches!(n, Notification::CalibrationProgress(CalibrationProgress { dots: Some(3), .. }))
        })
        .await;
        assert_eq!(manager.status().calibration_dots, 3);

        manager.disconnect().await;
        let got = drain(&mut rx);
        assert!(got.contains(&Notification::SerialStatus {
            status: LinkStatus::Disconnected,
            port: None,
        }));
        assert!(got.contains(&Notification::CalibrationProgress(CalibrationProgress {
            progress: 0.0,
            remaining: 30,
            active: false,
            dots: None,
        })));

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let status = manager.status();
        assert!(!status.reading);
        assert_eq!(status.port, None);
        assert_eq!(status.calibration_dots, 0);
        assert_eq!(lock(&opener.device).closes, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);
        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        let mut rx = manager.notifier().subscribe();

        manager.disconnect().await;
        let first: Vec<_> = drain(&mut rx).into_iter().map(normalize).collect();
        manager.disconnect().await;
        let second: Vec<_> = drain(&mut rx).into_iter().map(normalize).collect();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(lock(&opener.device).closes, 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);
        let mut rx = manager.notifier().subscribe();

        manager.disconnect().await;
        let names: Vec<_> = drain(&mut rx).iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["serial_status", "calibration_progress", "log_update"]);
    }

    #[tokio::test]
    async fn test_read_error_ends_pump_quietly() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);
        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        let mut rx = manager.notifier().subscribe();

        opener.push_error("device unplugged");
        let got = recv_until(&mut rx, |n| n.name() == "log_update").await;
        match got.last() {
            Some(Notification::LogUpdate { message, .. }) => {
                assert_eq!(message, "Serial read error: device unplugged")
            }
            other => panic!("unexpected {:?}", other),
        }

        wait_for_state(&manager, ConnectionState::Disconnected).await;
        assert!(!manager.status().reading);
        // No status change is announced on this path
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(drain(&mut rx).iter().all(|n| n.name() != "serial_status"));

        // The stream stays open until an explicit disconnect
        assert_eq!(lock(&opener.device).closes, 0);
        manager.disconnect().await;
        assert_eq!(lock(&opener.device).closes, 1);
    }

    #[tokio::test]
    async fn test_immediate_read_error_follows_connect_announcement() {
        let opener = MockOpener::default();
        opener.push_error("device unplugged");
        let (manager, _store) = manager_with(&opener);
        let mut rx = manager.notifier().subscribe();

        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        let got = recv_until(&mut rx, |n| {
            matches!(n, Notification::LogUpdate { message, .. } if message.starts_with("Serial read error"))
        })
        .await;

        assert_eq!(
            got[0],
            Notification::SerialStatus {
                status: LinkStatus::Connected,
                port: Some("/dev/ttyMOCK0".to_string()),
            }
        );
        match &got[1] {
            Notification::LogUpdate { message, .. } => {
                assert_eq!(message, "Connected to sensor on /dev/ttyMOCK0")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(got.len(), 3);

        wait_for_state(&manager, ConnectionState::Disconnected).await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);

        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        let first_id = manager.status().session_id;
        assert!(manager.connect("/dev/ttyMOCK0", 115200).await);
        let second_id = manager.status().session_id;

        assert_ne!(first_id, second_id);
        {
            let device = lock(&opener.device);
            assert_eq!(device.opens, 2);
            assert_eq!(device.closes, 1);
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_announces_current_status() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);

        let mut rx = manager.subscribe();
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::SerialStatus {
                status: LinkStatus::Disconnected,
                port: None,
            }
        );

        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        let mut late = manager.subscribe();
        assert_eq!(
            late.try_recv().unwrap(),
            Notification::SerialStatus {
                status: LinkStatus::Connected,
                port: Some("/dev/ttyMOCK0".to_string()),
            }
        );
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_writes_to_stream() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);
        assert!(manager.send(b"x").is_err());

        assert!(manager.connect("/dev/ttyMOCK0", 9600).await);
        manager.send(b"ping\n").unwrap();
        assert_eq!(lock(&opener.device).written, b"ping\n".to_vec());
        manager.disconnect().await;
        assert!(manager.send(b"x").is_err());
    }

    #[tokio::test]
    async fn test_list_ports_uses_opener() {
        let opener = MockOpener::default();
        let (manager, _store) = manager_with(&opener);
        let ports = manager.list_ports().unwrap();
        assert_eq!(ports[0].port_name, "/dev/ttyMOCK0");
    }
}
