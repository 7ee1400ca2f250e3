// src/io/serial/mod.rs
//
// Serial driver for the PIR sensor.
//
// Features:
// - Line framing with live calibration dot counting
// - Message classification (calibration, armed, motion start/end)
// - Motion episode timing and event persistence
// - Single-session connection management with a blocking read pump

pub mod calibration;
pub mod classifier;
pub mod framer;
pub mod motion;
pub mod port;
pub mod reader;
pub mod session;

pub use port::{list_serial_ports, DuplexStream, SerialPortInfo, SerialPortOpener, StreamOpener, StreamTimeouts};
pub use reader::{ConnectionManager, ConnectionState, ConnectionStatus};
