// src/io/serial/port.rs
//
// Byte stream capability used by the connection manager, and its
// serialport-backed implementation. The sensor link is always 8-N-1.

use serde::Serialize;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

use crate::settings::ConnectionTimings;

// ============================================================================
// Types
// ============================================================================

/// Read/write timeouts applied when a stream is opened
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl From<&ConnectionTimings> for StreamTimeouts {
    fn from(timings: &ConnectionTimings) -> Self {
        Self {
            read: Duration::from_millis(timings.read_timeout_ms),
            write: Duration::from_millis(timings.write_timeout_ms),
        }
    }
}

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// An open duplex byte stream to the device
pub trait DuplexStream: Send {
    /// Everything received so far. Empty when nothing is waiting.
    fn read_available(&mut self) -> Result<Vec<u8>, String>;

    fn write(&mut self, data: &[u8]) -> Result<(), String>;

    /// Discard anything queued in either direction
    fn reset_buffers(&mut self) -> Result<(), String>;

    /// Release the underlying device. Safe to call more than once.
    fn close(&mut self);
}

/// Opens streams and enumerates devices
pub trait StreamOpener: Send + Sync {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeouts: StreamTimeouts,
    ) -> Result<Box<dyn DuplexStream>, String>;

    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, String>;
}

// ============================================================================
// serialport Implementation
// ============================================================================

/// Opens real serial ports through the `serialport` crate
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialPortOpener;

impl StreamOpener for SerialPortOpener {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeouts: StreamTimeouts,
    ) -> Result<Box<dyn DuplexStream>, String> {
        let handle = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeouts.read)
            .open()
            .map_err(|e| format!("Failed to open {}: {}", port, e))?;

        tlog!("[serial] Opened {} at {} baud (8-N-1)", port, baud_rate);

        Ok(Box::new(SerialPortStream {
            name: port.to_string(),
            port: Some(handle),
            timeouts,
        }))
    }

    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, String> {
        list_serial_ports()
    }
}

pub struct SerialPortStream {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    timeouts: StreamTimeouts,
}

impl SerialPortStream {
    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, String> {
        let name = &self.name;
        self.port
            .as_mut()
            .ok_or_else(|| format!("{} is closed", name))
    }
}

impl DuplexStream for SerialPortStream {
    fn read_available(&mut self) -> Result<Vec<u8>, String> {
        let name = self.name.clone();
        let port = self.port_mut()?;

        let waiting = port
            .bytes_to_read()
            .map_err(|e| format!("Failed to query {}: {}", name, e))? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; waiting];
        match port.read(&mut buf) {
            Ok(0) => Err(format!("{} closed by device", name)),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            // Timeout is expected for serial reads
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(format!("Read error on {}: {}", name, e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), String> {
        let timeouts = self.timeouts;
        let port = self.port_mut()?;

        // serialport has a single timeout; use the write one for the duration of the write
        port.set_timeout(timeouts.write)
            .map_err(|e| format!("Failed to set write timeout: {}", e))?;
        let result = port
            .write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| format!("Serial write error: {}", e));
        let _ = port.set_timeout(timeouts.read);
        result
    }

    fn reset_buffers(&mut self) -> Result<(), String> {
        let name = self.name.clone();
        self.port_mut()?
            .clear(ClearBuffer::All)
            .map_err(|e| format!("Failed to clear buffers on {}: {}", name, e))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tlog!("[serial] Closed {}", self.name);
        }
    }
}

/// Serial ports that could host the sensor, USB adapters first.
///
/// On macOS each device appears twice; only the `/dev/cu.*` (calling unit)
/// node is listed since `/dev/tty.*` blocks on open until carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let found = serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    let mut ports: Vec<SerialPortInfo> = found
        .into_iter()
        .filter(|p| is_listed(&p.port_name))
        .map(SerialPortInfo::from)
        .collect();
    ports.sort_by_key(|p| (p.vid.is_none(), p.port_name.clone()));
    Ok(ports)
}

fn is_listed(name: &str) -> bool {
    !(cfg!(target_os = "macos") && name.starts_with("/dev/tty."))
}

impl From<serialport::SerialPortInfo> for SerialPortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let mut port = SerialPortInfo {
            port_name: info.port_name,
            port_type: String::new(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        };
        port.port_type = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                port.manufacturer = usb.manufacturer;
                port.product = usb.product;
                port.serial_number = usb.serial_number;
                port.vid = Some(usb.vid);
                port.pid = Some(usb.pid);
                "USB"
            }
            SerialPortType::BluetoothPort => "Bluetooth",
            SerialPortType::PciPort => "PCI",
            SerialPortType::Unknown => "Unknown",
        }
        .to_string();
        port
    }
}
