//! Test utilities for the driver
//!
//! [`SimulatedFx2`] is an in-memory OSR USB-FX2 board behind the [`UsbBus`]
//! trait. It loops bulk-out packets back to bulk-in, answers the vendor
//! control requests from a pair of wire-order registers, delivers injected
//! switch changes over the interrupt endpoint, and lets tests inject
//! failures, stalls, a suspended upstream hub, or a surprise unplug.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::SimulatedFx2;
//! use driver::{Driver, DriverConfig};
//!
//! let sim = SimulatedFx2::new();
//! let driver = Driver::register(DriverConfig::default());
//! let minor = driver.attach(sim.bus()).unwrap();
//!
//! driver.detach(minor).unwrap();
//! assert_eq!(sim.bus_releases(), 1);
//! ```

use crate::bus::{EndpointDescriptor, TransferKind, UsbBus};
use crate::sync::{lock, wait_timeout};
use protocol::{
    DeviceInfo, DeviceSpeed, PRODUCT_ID, UsbError, VENDOR_ID, VENDOR_IN_REQUEST,
    VENDOR_OUT_REQUEST, VendorRequest,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt-in endpoint of the board
pub const INTERRUPT_IN: u8 = 0x81;
/// Bulk-out endpoint of the board
pub const BULK_OUT: u8 = 0x06;
/// Bulk-in endpoint of the board
pub const BULK_IN: u8 = 0x88;

/// Endpoints declared by the board's interface 0
pub fn board_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor {
            address: INTERRUPT_IN,
            kind: TransferKind::Interrupt,
            max_packet_size: 1,
            interval: 1,
        },
        EndpointDescriptor {
            address: BULK_OUT,
            kind: TransferKind::Bulk,
            max_packet_size: 512,
            interval: 0,
        },
        EndpointDescriptor {
            address: BULK_IN,
            kind: TransferKind::Bulk,
            max_packet_size: 512,
            interval: 0,
        },
    ]
}

/// Create a mock DeviceInfo for the board
pub fn create_mock_device_info(vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        vendor_id,
        product_id,
        bus_number: 1,
        device_address: 4,
        manufacturer: Some("OSR".to_string()),
        product: Some("OSR USB-FX2 Learning Kit".to_string()),
        serial_number: None,
        speed: DeviceSpeed::High,
    }
}

#[derive(Debug)]
struct SimInner {
    info: DeviceInfo,
    endpoints: Vec<EndpointDescriptor>,
    /// Switch bytes waiting to be delivered on the interrupt endpoint
    switch_events: VecDeque<u8>,
    switch_state: u8,
    /// Bulk-out packets waiting to be read back
    loopback: VecDeque<Vec<u8>>,
    segments: u8,
    leds: u8,
    high_speed: bool,
    hub_suspended: bool,
    unplugged: bool,
    fail_next_control: Option<UsbError>,
    fail_next_interrupt: Option<UsbError>,
    fail_bulk_writes: bool,
    fail_clear_halt: Option<UsbError>,
    halted: HashSet<u8>,
    clear_halt_calls: Vec<u8>,
    control_requests: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    inner: Mutex<SimInner>,
    changed: Condvar,
    releases: AtomicUsize,
}

impl SimState {
    /// Block until `ready` yields a value, or fail with `Timeout`
    fn wait_for<T>(
        &self,
        timeout: Duration,
        mut ready: impl FnMut(&mut SimInner) -> Option<Result<T, UsbError>>,
    ) -> Result<T, UsbError> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);

        loop {
            if inner.unplugged {
                return Err(UsbError::NoDevice);
            }
            if let Some(result) = ready(&mut inner) {
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(UsbError::Timeout);
            }
            inner = wait_timeout(&self.changed, inner, deadline - now).0;
        }
    }
}

/// Simulated OSR USB-FX2 board
#[derive(Debug, Clone)]
pub struct SimulatedFx2 {
    state: Arc<SimState>,
}

impl Default for SimulatedFx2 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFx2 {
    pub fn new() -> Self {
        Self::with_endpoints(board_endpoints())
    }

    /// Board whose interface declares `endpoints` instead of the usual three
    pub fn with_endpoints(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self::build(create_mock_device_info(VENDOR_ID, PRODUCT_ID), endpoints)
    }

    /// Some other device, for id-table matching tests
    pub fn with_ids(vendor_id: u16, product_id: u16) -> Self {
        Self::build(
            create_mock_device_info(vendor_id, product_id),
            board_endpoints(),
        )
    }

    fn build(info: DeviceInfo, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            state: Arc::new(SimState {
                inner: Mutex::new(SimInner {
                    info,
                    endpoints,
                    switch_events: VecDeque::new(),
                    switch_state: 0,
                    loopback: VecDeque::new(),
                    segments: 0,
                    leds: 0,
                    high_speed: true,
                    hub_suspended: false,
                    unplugged: false,
                    fail_next_control: None,
                    fail_next_interrupt: None,
                    fail_bulk_writes: false,
                    fail_clear_halt: None,
                    halted: HashSet::new(),
                    clear_halt_calls: Vec::new(),
                    control_requests: Vec::new(),
                }),
                changed: Condvar::new(),
                releases: AtomicUsize::new(0),
            }),
        }
    }

    /// Bus handle for the claimed interface
    ///
    /// The returned handle counts as released when its last clone drops.
    pub fn bus(&self) -> Arc<dyn UsbBus> {
        Arc::new(SimulatedBus {
            state: Arc::clone(&self.state),
        })
    }

    fn update(&self, f: impl FnOnce(&mut SimInner)) {
        let mut inner = lock(&self.state.inner);
        f(&mut inner);
        self.state.changed.notify_all();
    }

    /// Flip the DIP switches; the new state is sent on the interrupt endpoint
    pub fn press_switches(&self, state: u8) {
        self.update(|inner| {
            inner.switch_state = state;
            inner.switch_events.push_back(state);
        });
    }

    pub fn set_hub_suspended(&self, suspended: bool) {
        self.update(|inner| inner.hub_suspended = suspended);
    }

    pub fn set_high_speed(&self, high_speed: bool) {
        self.update(|inner| inner.high_speed = high_speed);
    }

    /// Fail the next vendor control request with `error`
    pub fn fail_next_control(&self, error: UsbError) {
        self.update(|inner| inner.fail_next_control = Some(error));
    }

    /// Complete the next interrupt transfer with `error`
    pub fn fail_next_interrupt(&self, error: UsbError) {
        self.update(|inner| inner.fail_next_interrupt = Some(error));
    }

    /// Stall every bulk-out transfer while set
    pub fn fail_bulk_writes(&self, fail: bool) {
        self.update(|inner| inner.fail_bulk_writes = fail);
    }

    /// Make `clear_halt` fail with `error` (or succeed again with `None`)
    pub fn fail_clear_halt(&self, error: Option<UsbError>) {
        self.update(|inner| inner.fail_clear_halt = error);
    }

    /// Mark an endpoint as halted
    pub fn halt(&self, endpoint: u8) {
        self.update(|inner| {
            inner.halted.insert(endpoint);
        });
    }

    pub fn is_halted(&self, endpoint: u8) -> bool {
        lock(&self.state.inner).halted.contains(&endpoint)
    }

    /// Surprise removal: every later bus call fails with `NoDevice`
    pub fn unplug(&self) {
        self.update(|inner| inner.unplugged = true);
    }

    /// How many times the bus handle has been released
    pub fn bus_releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    /// 7-segment register as stored by the firmware (wire bit order)
    pub fn segments_wire(&self) -> u8 {
        lock(&self.state.inner).segments
    }

    /// Bargraph register as stored by the firmware (wire bit order)
    pub fn leds_wire(&self) -> u8 {
        lock(&self.state.inner).leds
    }

    /// Endpoints `clear_halt` was called on, in call order
    pub fn clear_halt_calls(&self) -> Vec<u8> {
        lock(&self.state.inner).clear_halt_calls.clone()
    }

    /// Vendor request codes received, in order
    pub fn control_requests(&self) -> Vec<u8> {
        lock(&self.state.inner).control_requests.clone()
    }

    /// Bytes written but not yet read back
    pub fn loopback_bytes(&self) -> usize {
        lock(&self.state.inner).loopback.iter().map(Vec::len).sum()
    }
}

/// [`UsbBus`] view of a [`SimulatedFx2`]
#[derive(Debug)]
pub struct SimulatedBus {
    state: Arc<SimState>,
}

impl Drop for SimulatedBus {
    fn drop(&mut self) {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl SimulatedBus {
    /// Common checks for vendor control requests
    fn control(
        &self,
        request_type: u8,
        expected_type: u8,
        request: u8,
    ) -> Result<std::sync::MutexGuard<'_, SimInner>, UsbError> {
        let mut inner = lock(&self.state.inner);
        if inner.unplugged {
            return Err(UsbError::NoDevice);
        }
        inner.control_requests.push(request);
        if let Some(error) = inner.fail_next_control.take() {
            return Err(error);
        }
        if request_type != expected_type {
            return Err(UsbError::Pipe);
        }
        Ok(inner)
    }
}

impl UsbBus for SimulatedBus {
    fn info(&self) -> DeviceInfo {
        lock(&self.state.inner).info.clone()
    }

    fn interface_number(&self) -> u8 {
        0
    }

    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        lock(&self.state.inner).endpoints.clone()
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let inner = self.control(request_type, VENDOR_IN_REQUEST, request)?;

        let value = match VendorRequest::try_from(request) {
            Ok(VendorRequest::ReadSegments) => inner.segments,
            Ok(VendorRequest::ReadLeds) => inner.leds,
            Ok(VendorRequest::ReadSwitches) => inner.switch_state,
            Ok(VendorRequest::IsHighSpeed) => u8::from(inner.high_speed),
            _ => return Err(UsbError::Pipe),
        };

        match buf.first_mut() {
            Some(byte) => {
                *byte = value;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut inner = self.control(request_type, VENDOR_OUT_REQUEST, request)?;
        let value = *buf.first().ok_or(UsbError::InvalidParam)?;

        match VendorRequest::try_from(request) {
            Ok(VendorRequest::WriteSegments) => inner.segments = value,
            Ok(VendorRequest::WriteLeds) => inner.leds = value,
            _ => return Err(UsbError::Pipe),
        }

        Ok(1)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.state.wait_for(timeout, |inner| {
            if inner.halted.contains(&endpoint) {
                return Some(Err(UsbError::Pipe));
            }
            let mut packet = inner.loopback.pop_front()?;
            let len = packet.len().min(buf.len());
            buf[..len].copy_from_slice(&packet[..len]);
            if len < packet.len() {
                inner.loopback.push_front(packet.split_off(len));
            }
            Some(Ok(len))
        })
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], _timeout: Duration) -> Result<usize, UsbError> {
        let mut inner = lock(&self.state.inner);
        if inner.unplugged {
            return Err(UsbError::NoDevice);
        }
        if inner.fail_bulk_writes || inner.halted.contains(&endpoint) {
            return Err(UsbError::Pipe);
        }

        inner.loopback.push_back(buf.to_vec());
        self.state.changed.notify_all();
        Ok(buf.len())
    }

    fn read_interrupt(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.state.wait_for(timeout, |inner| {
            if let Some(error) = inner.fail_next_interrupt.take() {
                return Some(Err(error));
            }
            let state = inner.switch_events.pop_front()?;
            match buf.first_mut() {
                Some(byte) => {
                    *byte = state;
                    Some(Ok(1))
                }
                None => Some(Err(UsbError::Overflow)),
            }
        })
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError> {
        let mut inner = lock(&self.state.inner);
        if inner.unplugged {
            return Err(UsbError::NoDevice);
        }
        inner.clear_halt_calls.push(endpoint);
        if let Some(error) = inner.fail_clear_halt.clone() {
            return Err(error);
        }
        inner.halted.remove(&endpoint);
        Ok(())
    }

    fn ensure_reachable(&self) -> Result<(), UsbError> {
        let inner = lock(&self.state.inner);
        if inner.unplugged {
            Err(UsbError::NoDevice)
        } else if inner.hub_suspended {
            Err(UsbError::HostUnreachable)
        } else {
            Ok(())
        }
    }
}
