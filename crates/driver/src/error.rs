//! Driver error types

use crate::endpoints::EndpointRole;
use protocol::{ProtocolError, UsbError, VendorRequest};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// Buffer or transfer object could not be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Interface lacks one of the three endpoints the board must expose
    #[error("Missing {0} endpoint")]
    MissingEndpoint(EndpointRole),

    /// Requested bulk direction is already claimed by another handle
    #[error("Bulk channel busy")]
    Busy,

    /// Handle was not opened for the requested direction
    #[error("Handle not opened for {0}")]
    WrongAccessMode(&'static str),

    #[error("Transfer failed: {0}")]
    TransferFailed(UsbError),

    #[error("Control request {request:?} failed: {source}")]
    ControlTransferFailed {
        request: VendorRequest,
        source: UsbError,
    },

    /// Blocking wait abandoned because the caller was signalled
    #[error("Interrupted")]
    Interrupted,

    #[error("Device disconnected")]
    NoDevice,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Attribute {0} is read-only")]
    ReadOnlyAttribute(&'static str),

    #[error("No device published with minor {0}")]
    UnknownMinor(u32),

    #[error("No device named {0}")]
    UnknownDevice(String),

    #[error("Device {vendor_id:04x}:{product_id:04x} is not handled by this driver")]
    NotMatched { vendor_id: u16, product_id: u16 },

    /// Bus-level failure outside a transfer (opening, claiming, descriptors)
    #[error("Bus error: {0}")]
    Bus(UsbError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl DriverError {
    /// Classify a failed data transfer
    pub fn from_transfer(error: UsbError) -> Self {
        match error {
            UsbError::Timeout => DriverError::Timeout,
            UsbError::NoDevice => DriverError::NoDevice,
            UsbError::Interrupted => DriverError::Interrupted,
            other => DriverError::TransferFailed(other),
        }
    }
}

impl From<DriverError> for std::io::Error {
    fn from(error: DriverError) -> Self {
        use std::io::ErrorKind;

        let kind = match &error {
            DriverError::ResourceExhausted(_) => ErrorKind::OutOfMemory,
            DriverError::Busy => ErrorKind::ResourceBusy,
            DriverError::WrongAccessMode(_) | DriverError::ReadOnlyAttribute(_) => {
                ErrorKind::PermissionDenied
            }
            DriverError::Interrupted => ErrorKind::Interrupted,
            DriverError::NoDevice
            | DriverError::UnknownMinor(_)
            | DriverError::UnknownDevice(_) => ErrorKind::NotFound,
            DriverError::Timeout => ErrorKind::TimedOut,
            DriverError::Protocol(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };

        std::io::Error::new(kind, error)
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
