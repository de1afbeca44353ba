//! Bulk channel access gate
//!
//! At most one handle may read and at most one may write the loopback
//! channel at a time. Each direction is a single atomic slot; opening a
//! handle claims the slots for its access mode or fails with
//! [`DriverError::Busy`] without holding anything.

use crate::bus::UsbBus;
use crate::endpoints::EndpointTable;
use crate::error::{DriverError, Result};
use protocol::UsbError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Direction(s) a handle is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::ReadWrite => "read-write",
        })
    }
}

/// Slots held by one open handle
///
/// Must be handed back through [`AccessGate::release`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct BulkClaim {
    read: bool,
    write: bool,
}

impl BulkClaim {
    pub fn has_read(&self) -> bool {
        self.read
    }

    pub fn has_write(&self) -> bool {
        self.write
    }
}

#[derive(Debug, Default)]
pub struct AccessGate {
    read_slot: AtomicBool,
    write_slot: AtomicBool,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(slot: &AtomicBool) -> bool {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the slots for `mode`, all or nothing
    ///
    /// The write slot is taken first. Each successful claim resets the
    /// matching pipe by clearing any halt on it; a failed halt clear is
    /// logged and does not fail the open.
    pub fn acquire(
        &self,
        mode: AccessMode,
        bus: &dyn UsbBus,
        endpoints: &EndpointTable,
    ) -> Result<BulkClaim> {
        let mut claim = BulkClaim {
            read: false,
            write: false,
        };

        if mode.writes() {
            if !Self::try_take(&self.write_slot) {
                debug!("Bulk write slot busy");
                return Err(DriverError::Busy);
            }
            claim.write = true;
            reset_pipe(bus, endpoints.bulk_out.address);
        }

        if mode.reads() {
            if !Self::try_take(&self.read_slot) {
                debug!("Bulk read slot busy");
                self.release(claim);
                return Err(DriverError::Busy);
            }
            claim.read = true;
            reset_pipe(bus, endpoints.bulk_in.address);
        }

        Ok(claim)
    }

    pub fn release(&self, claim: BulkClaim) {
        if claim.write {
            self.write_slot.store(false, Ordering::Release);
        }
        if claim.read {
            self.read_slot.store(false, Ordering::Release);
        }
    }

    pub fn is_read_held(&self) -> bool {
        self.read_slot.load(Ordering::Acquire)
    }

    pub fn is_write_held(&self) -> bool {
        self.write_slot.load(Ordering::Acquire)
    }
}

fn reset_pipe(bus: &dyn UsbBus, endpoint: u8) {
    match bus.clear_halt(endpoint) {
        Ok(()) => {}
        // Pipe was not halted
        Err(UsbError::Pipe) => {}
        Err(e) => warn!("Failed to clear halt on {:#04x}: {}", endpoint, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{BULK_IN, BULK_OUT, SimulatedFx2};

    fn setup() -> (SimulatedFx2, AccessGate, EndpointTable) {
        let sim = SimulatedFx2::new();
        let endpoints = EndpointTable::scan(&sim.bus().endpoints()).unwrap();
        (sim, AccessGate::new(), endpoints)
    }

    #[test]
    fn test_single_writer() {
        let (sim, gate, endpoints) = setup();
        let bus = sim.bus();

        let first = gate.acquire(AccessMode::Write, &*bus, &endpoints).unwrap();
        assert!(matches!(
            gate.acquire(AccessMode::Write, &*bus, &endpoints),
            Err(DriverError::Busy)
        ));

        // Reader is independent of the writer
        let reader = gate.acquire(AccessMode::Read, &*bus, &endpoints).unwrap();

        gate.release(first);
        gate.release(reader);
        assert!(!gate.is_write_held());
        assert!(!gate.is_read_held());
    }

    #[test]
    fn test_read_write_is_all_or_nothing() {
        let (sim, gate, endpoints) = setup();
        let bus = sim.bus();

        let reader = gate.acquire(AccessMode::Read, &*bus, &endpoints).unwrap();
        assert!(matches!(
            gate.acquire(AccessMode::ReadWrite, &*bus, &endpoints),
            Err(DriverError::Busy)
        ));
        // Write slot was rolled back
        assert!(!gate.is_write_held());

        gate.release(reader);
        let both = gate
            .acquire(AccessMode::ReadWrite, &*bus, &endpoints)
            .unwrap();
        assert!(both.has_read() && both.has_write());
        gate.release(both);
    }

    #[test]
    fn test_claim_clears_halts() {
        let (sim, gate, endpoints) = setup();
        let bus = sim.bus();
        sim.halt(BULK_OUT);
        sim.halt(BULK_IN);

        let claim = gate
            .acquire(AccessMode::ReadWrite, &*bus, &endpoints)
            .unwrap();
        assert_eq!(sim.clear_halt_calls(), vec![BULK_OUT, BULK_IN]);
        assert!(!sim.is_halted(BULK_OUT));
        assert!(!sim.is_halted(BULK_IN));
        gate.release(claim);
    }

    #[test]
    fn test_halt_clear_failure_does_not_fail_open() {
        let (sim, gate, endpoints) = setup();
        let bus = sim.bus();
        sim.fail_clear_halt(Some(UsbError::Io));

        let claim = gate.acquire(AccessMode::Write, &*bus, &endpoints).unwrap();
        assert!(claim.has_write());
        gate.release(claim);
    }
}
