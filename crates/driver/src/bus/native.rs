//! libusb backend
//!
//! Wraps a `rusb` device handle with the claimed interface. Opening detaches
//! any kernel driver bound to the interface and claims it; dropping the bus
//! releases the interface and hands it back to the kernel.

use super::{EndpointDescriptor, TransferKind, UsbBus};
use protocol::{DeviceInfo, DeviceSpeed, UsbError};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// [`UsbBus`] over a libusb device handle
pub struct RusbBus {
    handle: DeviceHandle<Context>,
    interface: u8,
    info: DeviceInfo,
    endpoints: Vec<EndpointDescriptor>,
    kernel_driver_detached: bool,
}

impl RusbBus {
    /// Open `device` and claim `interface` of its active configuration
    pub fn open(device: &Device<Context>, interface: u8) -> Result<Self, UsbError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        let info = device_info(device, Some(&handle))?;
        let endpoints = interface_endpoints(device, interface)?;

        let mut kernel_driver_detached = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => kernel_driver_detached = true,
                    // Claiming below will report the real failure
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e));
        }

        debug!(
            "Claimed interface {} on bus {:03} device {:03}",
            interface, info.bus_number, info.device_address
        );

        Ok(Self {
            handle,
            interface,
            info,
            endpoints,
            kernel_driver_detached,
        })
    }
}

impl Drop for RusbBus {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }

        if self.kernel_driver_detached {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", self.interface);
            }
        }
    }
}

impl UsbBus for RusbBus {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn interface_number(&self) -> u8 {
        self.interface
    }

    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.clone()
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .write_control(request_type, request, value, index, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize, UsbError> {
        self.handle
            .write_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError> {
        self.handle.clear_halt(endpoint).map_err(map_rusb_error)
    }
}

/// List devices on the bus matching `vendor_id`/`product_id`
pub fn find_devices(
    context: &Context,
    vendor_id: u16,
    product_id: u16,
) -> Result<Vec<Device<Context>>, UsbError> {
    let devices = context.devices().map_err(map_rusb_error)?;

    Ok(devices
        .iter()
        .filter(|device| {
            device
                .device_descriptor()
                .map(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
                .unwrap_or(false)
        })
        .collect())
}

/// Describe a device, reading string descriptors when a handle is available
pub fn device_info(
    device: &Device<Context>,
    handle: Option<&DeviceHandle<Context>>,
) -> Result<DeviceInfo, UsbError> {
    let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

    let read_string = |index: Option<u8>| {
        handle.and_then(|h| index.and_then(|idx| h.read_string_descriptor_ascii(idx).ok()))
    };

    Ok(DeviceInfo {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        device_address: device.address(),
        manufacturer: read_string(descriptor.manufacturer_string_index()),
        product: read_string(descriptor.product_string_index()),
        serial_number: read_string(descriptor.serial_number_string_index()),
        speed: map_device_speed(device.speed()),
    })
}

/// Endpoints of the first alternate setting of `interface`
fn interface_endpoints(
    device: &Device<Context>,
    interface: u8,
) -> Result<Vec<EndpointDescriptor>, UsbError> {
    let config = device.active_config_descriptor().map_err(|e| {
        warn!("Failed to get active config descriptor: {}", e);
        map_rusb_error(e)
    })?;

    let setting = config
        .interfaces()
        .filter(|i| i.number() == interface)
        .flat_map(|i| i.descriptors())
        .find(|d| d.setting_number() == 0)
        .ok_or(UsbError::NotFound)?;

    Ok(setting
        .endpoint_descriptors()
        .map(|ep| EndpointDescriptor {
            address: ep.address(),
            kind: map_transfer_type(ep.transfer_type()),
            max_packet_size: ep.max_packet_size(),
            interval: ep.interval(),
        })
        .collect())
}

fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Map rusb device speed to protocol DeviceSpeed
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::Interrupted => UsbError::Interrupted,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
