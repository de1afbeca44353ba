//! Vendor control requests understood by the FX2 firmware

use crate::error::{ProtocolError, Result};
use std::time::Duration;

/// OSR USB-FX2 vendor id
pub const VENDOR_ID: u16 = 0x0547;

/// OSR USB-FX2 product id
pub const PRODUCT_ID: u16 = 0x1002;

/// bmRequestType for device-to-host vendor requests (IN | Vendor | Device)
pub const VENDOR_IN_REQUEST: u8 = 0xC0;

/// bmRequestType for host-to-device vendor requests (OUT | Vendor | Device)
pub const VENDOR_OUT_REQUEST: u8 = 0x40;

/// Timeout for vendor control requests
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor request codes
///
/// All requests carry `wValue = 0`, `wIndex = 0` and a single data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VendorRequest {
    ReadSegments = 0xD4,
    ReadSwitches = 0xD6,
    ReadLeds = 0xD7,
    WriteLeds = 0xD8,
    IsHighSpeed = 0xD9,
    WriteSegments = 0xDB,
}

impl VendorRequest {
    /// Request code as sent in `bRequest`
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the data stage flows from device to host
    pub fn is_read(self) -> bool {
        !matches!(self, VendorRequest::WriteLeds | VendorRequest::WriteSegments)
    }

    /// bmRequestType matching the request direction
    pub fn request_type(self) -> u8 {
        if self.is_read() {
            VENDOR_IN_REQUEST
        } else {
            VENDOR_OUT_REQUEST
        }
    }
}

impl TryFrom<u8> for VendorRequest {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0xD4 => Ok(VendorRequest::ReadSegments),
            0xD6 => Ok(VendorRequest::ReadSwitches),
            0xD7 => Ok(VendorRequest::ReadLeds),
            0xD8 => Ok(VendorRequest::WriteLeds),
            0xD9 => Ok(VendorRequest::IsHighSpeed),
            0xDB => Ok(VendorRequest::WriteSegments),
            other => Err(ProtocolError::UnknownRequest(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_codes() {
        assert_eq!(VendorRequest::ReadSegments.code(), 0xD4);
        assert_eq!(VendorRequest::WriteSegments.code(), 0xDB);
        assert_eq!(VendorRequest::ReadLeds.code(), 0xD7);
        assert_eq!(VendorRequest::WriteLeds.code(), 0xD8);
        assert_eq!(VendorRequest::ReadSwitches.code(), 0xD6);
        assert_eq!(VendorRequest::IsHighSpeed.code(), 0xD9);
    }

    #[test]
    fn test_request_direction() {
        assert_eq!(VendorRequest::ReadLeds.request_type(), VENDOR_IN_REQUEST);
        assert_eq!(VendorRequest::IsHighSpeed.request_type(), VENDOR_IN_REQUEST);
        assert_eq!(VendorRequest::WriteLeds.request_type(), VENDOR_OUT_REQUEST);
        assert_eq!(
            VendorRequest::WriteSegments.request_type(),
            VENDOR_OUT_REQUEST
        );
        // Bit 7 = 1 means IN (device to host)
        assert!((VENDOR_IN_REQUEST & 0x80) != 0);
        assert!((VENDOR_OUT_REQUEST & 0x80) == 0);
    }

    #[test]
    fn test_try_from_code() {
        for request in [
            VendorRequest::ReadSegments,
            VendorRequest::ReadSwitches,
            VendorRequest::ReadLeds,
            VendorRequest::WriteLeds,
            VendorRequest::IsHighSpeed,
            VendorRequest::WriteSegments,
        ] {
            assert_eq!(VendorRequest::try_from(request.code()), Ok(request));
        }
        assert_eq!(
            VendorRequest::try_from(0x00),
            Err(ProtocolError::UnknownRequest(0x00))
        );
    }
}
