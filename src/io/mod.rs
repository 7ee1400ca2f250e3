// src/io/mod.rs
//
// Device I/O. The sensor only speaks over a serial link.

pub mod serial;

pub use serial::{ConnectionManager, ConnectionState, ConnectionStatus, SerialPortInfo};
