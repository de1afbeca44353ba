//! Host-side driver core for the OSR USB-FX2 learning kit
//!
//! The board exposes a DIP switch bank (reported over an interrupt
//! endpoint), a 7-segment display and an LED bargraph (vendor control
//! requests), and a bulk loopback pipe. This crate owns the per-device
//! context and coordinates everything that can touch it concurrently:
//! user reads and writes, interrupt completions, suspend/resume, and
//! disconnect.
//!
//! # Architecture
//!
//! ```text
//! Driver::attach ──► DeviceContext ──► TransferManager ──► UsbBus
//!      │                  │  │              (interrupt worker,
//!      │                  │  │               bulk-out worker)
//!      ▼                  │  └──► VendorControlFacade ──► control requests
//!  published minors       └─────► AccessGate (bulk read/write slots)
//!      │
//!      ├──► DeviceFile (open/read/write/close)
//!      └──► DeviceAttributes (switches, bargraph, 7segment)
//! ```
//!
//! The bus itself is abstracted behind [`UsbBus`]; [`bus::native`] provides
//! the libusb backend. With the `test-utils` feature, `test_utils` adds a
//! simulated board.

pub mod attributes;
pub mod bus;
pub mod context;
pub mod endpoints;
pub mod error;
pub mod file;
pub mod gate;
pub mod lifecycle;
pub mod power;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfers;
pub mod urb;
pub mod vendor;

mod sync;

pub use attributes::{Attribute, DeviceAttributes};
pub use bus::{EndpointDescriptor, TransferKind, UsbBus};
pub use context::{DeviceContext, SwitchEvent, SwitchMonitor};
pub use endpoints::{Endpoint, EndpointRole, EndpointTable};
pub use error::{DriverError, Result};
pub use file::DeviceFile;
pub use gate::{AccessGate, AccessMode, BulkClaim};
pub use lifecycle::{
    DRIVER_NAME, DeviceMatch, Driver, DriverConfig, MINOR_BASE, device_name, minor_for_name,
};
pub use power::{PowerMode, PowerState, SignalFlag};
pub use transfers::{TransferConfig, TransferManager};
pub use urb::{BulkOutCompletion, Completion, TransferStatus};
pub use vendor::{OutputReading, SwitchBank, VendorControlFacade};
