//! Shared type definitions
//!
//! Transport status codes, bus-level device descriptions and the status
//! snapshot reported by the tooling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device speed as negotiated on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
    Unknown,
}

/// Device information returned by bus enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
    /// Negotiated speed
    pub speed: DeviceSpeed,
}

/// USB transport errors
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("entity not found")]
    NotFound,
    /// Device or transfer is busy
    #[error("resource busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("input/output error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Blocking call interrupted
    #[error("interrupted")]
    Interrupted,
    /// Upstream hub or port is not reachable (still suspended)
    #[error("host unreachable")]
    HostUnreachable,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

/// Snapshot of one attached board, as reported by the tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Published device name (e.g. `osrfx2_0`)
    pub name: String,
    /// Minor number
    pub minor: u32,
    /// Switch attribute text
    pub switches: String,
    /// Bargraph attribute text (or the suspended sentinel)
    pub bargraph: String,
    /// 7-segment attribute text (or the suspended sentinel)
    pub segments: String,
    /// Power state
    pub suspended: bool,
    /// High-speed operation, if the query succeeded
    pub high_speed: Option<bool>,
    /// Diagnostic count of bulk bytes written but not yet read back
    pub pending_bytes: i64,
    /// Number of live references to the device context
    pub references: usize,
}
