//! Wire-level definitions for the OSR USB-FX2 learning kit
//!
//! This crate describes everything the host needs to know about the board
//! without performing any I/O: identification, the vendor control requests,
//! the bit wiring of the 7-segment display and the LED bargraph, the text
//! format used by the attribute surface, and the transport error enum.
//!
//! # Example
//!
//! ```
//! use protocol::{BitPermutation, format_pattern};
//!
//! let wire = BitPermutation::BARGRAPH.to_wire(0xFF);
//! assert_eq!(wire, 0xFF);
//! assert_eq!(format_pattern(BitPermutation::BARGRAPH.from_wire(wire)), "11111111");
//! ```

pub mod bits;
pub mod error;
pub mod requests;
pub mod types;

pub use bits::{
    BitPermutation, SUSPENDED_SENTINEL, clamp_pattern, format_pattern, map_bargraph_bits,
    map_segment_bits, parse_decimal, unmap_bargraph_bits, unmap_segment_bits,
};
pub use error::{ProtocolError, Result};
pub use requests::{
    CONTROL_TIMEOUT, PRODUCT_ID, VENDOR_ID, VENDOR_IN_REQUEST, VENDOR_OUT_REQUEST, VendorRequest,
};
pub use types::{DeviceInfo, DeviceSpeed, DeviceStatus, UsbError};
