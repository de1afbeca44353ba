//! Bus abstraction
//!
//! The driver never talks to libusb directly. Everything it needs from the
//! bus subsystem (descriptors, control/bulk/interrupt transfers, halt
//! clearing) goes through [`UsbBus`], so the same core runs against real
//! hardware ([`native::RusbBus`]) and the simulated board used in tests.
//!
//! All calls are synchronous and bounded by a timeout; the asynchronous
//! transfer lifecycle is built on top of them in [`crate::urb`].

pub mod native;

use protocol::{DeviceInfo, UsbError};
use std::time::Duration;

/// Endpoint transfer type, from bmAttributes bits 0..1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor of the claimed interface's current alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (bit 7 set for IN)
    pub address: u8,
    pub kind: TransferKind,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// Transfer primitives provided by the bus subsystem for one claimed interface
///
/// A `UsbBus` handle is the driver's counted reference to the underlying
/// device: it is shared between the device context and its transfer
/// workers, and dropping the last clone releases the device.
pub trait UsbBus: Send + Sync + 'static {
    /// Descriptor-level identification of the device
    fn info(&self) -> DeviceInfo;

    /// Number of the claimed interface
    fn interface_number(&self) -> u8;

    /// Endpoints declared by the interface's current alternate setting
    fn endpoints(&self) -> Vec<EndpointDescriptor>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> Result<usize, UsbError>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Read one interrupt packet; `Err(UsbError::Timeout)` means nothing arrived yet
    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Clear a halt/stall condition on an endpoint
    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Check that new transfers can be queued to the device
    ///
    /// Fails with [`UsbError::HostUnreachable`] while the upstream port is
    /// still suspended.
    fn ensure_reachable(&self) -> Result<(), UsbError> {
        Ok(())
    }
}
