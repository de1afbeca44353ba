//! Vendor control requests
//!
//! Typed access to the board's outputs and state over endpoint 0. Output
//! values are exchanged in logical bit order and translated through the
//! board's wiring permutations; the device context keeps a mirror of the
//! last value written in wire order.

use crate::context::DeviceContext;
use crate::error::{DriverError, Result};
use protocol::{
    SUSPENDED_SENTINEL, VendorRequest, clamp_pattern, format_pattern, map_bargraph_bits,
    map_segment_bits, unmap_bargraph_bits, unmap_segment_bits,
};
use std::fmt;
use tracing::{debug, warn};

/// State of the DIP switch bank as last reported by the interrupt endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchBank(pub u8);

impl SwitchBank {
    /// Whether switch `n` (0-based, 0 = lowest-order) is on
    pub fn is_on(&self, n: u8) -> bool {
        n < 8 && self.0 & (1 << n) != 0
    }
}

impl fmt::Display for SwitchBank {
    /// Eight '0'/'1' characters, highest-order switch leftmost
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_pattern(self.0))
    }
}

/// Value read back from the 7-segment display or the bargraph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputReading {
    /// Logical pattern currently shown
    Value(u8),
    /// Device is suspended; the hardware was not queried
    Suspended,
}

impl fmt::Display for OutputReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputReading::Value(value) => f.write_str(&format_pattern(*value)),
            OutputReading::Suspended => f.write_str(SUSPENDED_SENTINEL),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Output {
    Segments,
    Leds,
}

impl Output {
    fn read_request(self) -> VendorRequest {
        match self {
            Output::Segments => VendorRequest::ReadSegments,
            Output::Leds => VendorRequest::ReadLeds,
        }
    }

    fn write_request(self) -> VendorRequest {
        match self {
            Output::Segments => VendorRequest::WriteSegments,
            Output::Leds => VendorRequest::WriteLeds,
        }
    }

    fn to_wire(self, logical: u8) -> u8 {
        match self {
            Output::Segments => map_segment_bits(logical),
            Output::Leds => map_bargraph_bits(logical),
        }
    }

    fn from_wire(self, wire: u8) -> u8 {
        match self {
            Output::Segments => unmap_segment_bits(wire),
            Output::Leds => unmap_bargraph_bits(wire),
        }
    }
}

/// Control-request view of one device context
pub struct VendorControlFacade<'a> {
    ctx: &'a DeviceContext,
}

impl<'a> VendorControlFacade<'a> {
    pub fn new(ctx: &'a DeviceContext) -> Self {
        Self { ctx }
    }

    /// Switch state from the interrupt mirror; no bus traffic
    pub fn read_switches(&self) -> SwitchBank {
        SwitchBank(self.ctx.switches().current())
    }

    pub fn read_segments(&self) -> Result<OutputReading> {
        self.read_output(Output::Segments)
    }

    pub fn read_leds(&self) -> Result<OutputReading> {
        self.read_output(Output::Leds)
    }

    /// Show `value` on the 7-segment display; out-of-range values blank it
    pub fn write_segments(&self, value: i64) -> Result<()> {
        self.write_output(Output::Segments, value)
    }

    /// Show `value` on the bargraph; out-of-range values blank it
    pub fn write_leds(&self, value: i64) -> Result<()> {
        self.write_output(Output::Leds, value)
    }

    /// Whether the device negotiated high speed
    pub fn is_high_speed(&self) -> Result<bool> {
        Ok(self.read_byte(VendorRequest::IsHighSpeed)? != 0)
    }

    fn read_output(&self, output: Output) -> Result<OutputReading> {
        if self.ctx.is_suspended() {
            return Ok(OutputReading::Suspended);
        }

        let wire = self.read_byte(output.read_request())?;
        match output {
            Output::Segments => self.ctx.set_segments_wire(wire),
            Output::Leds => self.ctx.set_leds_wire(wire),
        }

        Ok(OutputReading::Value(output.from_wire(wire)))
    }

    fn write_output(&self, output: Output, value: i64) -> Result<()> {
        let wire = output.to_wire(clamp_pattern(value));

        // Mirror is updated before the device confirms
        match output {
            Output::Segments => self.ctx.set_segments_wire(wire),
            Output::Leds => self.ctx.set_leds_wire(wire),
        }

        let request = output.write_request();
        let timeout = self.ctx.transfers().config().control_timeout;
        self.ctx
            .bus()
            .write_control(request.request_type(), request.code(), 0, 0, &[wire], timeout)
            .map_err(|source| {
                warn!(
                    "{:?} failed ({}); mirror keeps unconfirmed value {:#04x}",
                    request, source, wire
                );
                DriverError::ControlTransferFailed { request, source }
            })?;

        debug!("{:?} <- {:#04x}", request, wire);
        Ok(())
    }

    fn read_byte(&self, request: VendorRequest) -> Result<u8> {
        let mut buf = [0u8; 1];
        let timeout = self.ctx.transfers().config().control_timeout;

        let count = self
            .ctx
            .bus()
            .read_control(request.request_type(), request.code(), 0, 0, &mut buf, timeout)
            .map_err(|source| {
                debug!("{:?} failed: {}", request, source);
                DriverError::ControlTransferFailed { request, source }
            })?;

        if count == 0 {
            return Err(DriverError::ControlTransferFailed {
                request,
                source: protocol::UsbError::Overflow,
            });
        }

        debug!("{:?} -> {:#04x}", request, buf[0]);
        Ok(buf[0])
    }

    /// Last wire value stored for the 7-segment display
    pub fn segments_mirror(&self) -> u8 {
        self.ctx.segments_wire()
    }

    /// Last wire value stored for the bargraph
    pub fn leds_mirror(&self) -> u8 {
        self.ctx.leds_wire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::SignalFlag;
    use crate::test_utils::SimulatedFx2;
    use crate::transfers::TransferConfig;
    use protocol::UsbError;
    use std::sync::Arc;

    fn context(sim: &SimulatedFx2) -> Arc<DeviceContext> {
        DeviceContext::create(192, "osrfx2_0".to_string(), sim.bus(), TransferConfig::default())
            .unwrap()
    }

    #[test]
    fn test_switch_bank_display() {
        assert_eq!(SwitchBank(0x80).to_string(), "10000000");
        assert_eq!(SwitchBank(0x01).to_string(), "00000001");
        assert!(SwitchBank(0x04).is_on(2));
        assert!(!SwitchBank(0x04).is_on(3));
    }

    #[test]
    fn test_output_reading_display() {
        assert_eq!(OutputReading::Value(0xFF).to_string(), "11111111");
        assert_eq!(OutputReading::Suspended.to_string(), "S ");
    }

    #[test]
    fn test_leds_round_trip() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let vendor = ctx.vendor();

        vendor.write_leds(255).unwrap();
        assert_eq!(vendor.read_leds().unwrap().to_string(), "11111111");

        vendor.write_leds(1).unwrap();
        assert_eq!(sim.leds_wire(), map_bargraph_bits(1));
        assert_eq!(vendor.read_leds().unwrap(), OutputReading::Value(1));
    }

    #[test]
    fn test_segments_use_wire_order() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let vendor = ctx.vendor();

        vendor.write_segments(0x80).unwrap();
        assert_eq!(sim.segments_wire(), 0x08);
        assert_eq!(vendor.read_segments().unwrap(), OutputReading::Value(0x80));
    }

    #[test]
    fn test_out_of_range_blanks_output() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let vendor = ctx.vendor();

        vendor.write_leds(255).unwrap();
        vendor.write_leds(256).unwrap();
        assert_eq!(sim.leds_wire(), 0);
        vendor.write_segments(-1).unwrap();
        assert_eq!(sim.segments_wire(), 0);
    }

    #[test]
    fn test_failed_write_keeps_mirror() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let vendor = ctx.vendor();

        sim.fail_next_control(UsbError::Timeout);
        let err = vendor.write_leds(0x0F).unwrap_err();
        assert!(matches!(
            err,
            DriverError::ControlTransferFailed {
                request: VendorRequest::WriteLeds,
                source: UsbError::Timeout
            }
        ));

        // Device never saw it, the mirror did
        assert_eq!(sim.leds_wire(), 0);
        assert_eq!(vendor.leds_mirror(), map_bargraph_bits(0x0F));
    }

    #[test]
    fn test_failed_read_is_reported() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);

        sim.fail_next_control(UsbError::Pipe);
        assert!(matches!(
            ctx.vendor().read_segments(),
            Err(DriverError::ControlTransferFailed {
                request: VendorRequest::ReadSegments,
                ..
            })
        ));
    }

    #[test]
    fn test_suspended_reads_skip_hardware() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let signal = SignalFlag::new();

        ctx.suspend(&signal).unwrap();
        let before = sim.control_requests().len();
        assert_eq!(ctx.vendor().read_leds().unwrap(), OutputReading::Suspended);
        assert_eq!(ctx.vendor().read_segments().unwrap(), OutputReading::Suspended);
        assert_eq!(sim.control_requests().len(), before);

        ctx.resume(&signal).unwrap();
        assert!(matches!(
            ctx.vendor().read_segments().unwrap(),
            OutputReading::Value(_)
        ));
    }

    #[test]
    fn test_high_speed_query() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);

        assert!(ctx.vendor().is_high_speed().unwrap());
        sim.set_high_speed(false);
        assert!(!ctx.vendor().is_high_speed().unwrap());
        assert_eq!(sim.control_requests().last(), Some(&0xD9));
    }
}
