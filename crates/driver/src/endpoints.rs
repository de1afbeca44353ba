//! Endpoint table
//!
//! The board's interface declares three endpoints the driver depends on:
//! an interrupt-in pipe for switch changes and a bulk-in/bulk-out pair for
//! the loopback channel. The table is filled once at attach and never
//! changes afterwards.

use crate::bus::{EndpointDescriptor, TransferKind};
use crate::error::{DriverError, Result};
use std::fmt;
use tracing::debug;

/// Role an endpoint plays for the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    InterruptIn,
    BulkIn,
    BulkOut,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointRole::InterruptIn => "interrupt-in",
            EndpointRole::BulkIn => "bulk-in",
            EndpointRole::BulkOut => "bulk-out",
        };
        f.write_str(name)
    }
}

/// One endpoint used by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// Maximum packet size in bytes
    pub max_packet_size: u16,
    /// Polling interval (only meaningful for the interrupt endpoint)
    pub interval: u8,
}

impl From<&EndpointDescriptor> for Endpoint {
    fn from(desc: &EndpointDescriptor) -> Self {
        Endpoint {
            address: desc.address,
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointTable {
    pub interrupt_in: Endpoint,
    pub bulk_in: Endpoint,
    pub bulk_out: Endpoint,
}

impl EndpointTable {
    /// Build the table from the interface's declared endpoints
    ///
    /// When an interface declares more than one endpoint of a role, the last
    /// one wins. Fails with [`DriverError::MissingEndpoint`] naming the first
    /// role that has no candidate.
    pub fn scan(descriptors: &[EndpointDescriptor]) -> Result<Self> {
        let mut interrupt_in = None;
        let mut bulk_in = None;
        let mut bulk_out = None;

        for desc in descriptors {
            let slot = match (desc.kind, desc.is_in()) {
                (TransferKind::Interrupt, true) => &mut interrupt_in,
                (TransferKind::Bulk, true) => &mut bulk_in,
                (TransferKind::Bulk, false) => &mut bulk_out,
                _ => continue,
            };

            debug!(
                "Found {:?} endpoint {:#04x} (max packet {}, interval {})",
                desc.kind, desc.address, desc.max_packet_size, desc.interval
            );
            *slot = Some(Endpoint::from(desc));
        }

        let table = EndpointTable {
            interrupt_in: interrupt_in.ok_or(DriverError::MissingEndpoint(EndpointRole::InterruptIn))?,
            bulk_in: bulk_in.ok_or(DriverError::MissingEndpoint(EndpointRole::BulkIn))?,
            bulk_out: bulk_out.ok_or(DriverError::MissingEndpoint(EndpointRole::BulkOut))?,
        };

        Ok(table)
    }

    pub fn get(&self, role: EndpointRole) -> &Endpoint {
        match role {
            EndpointRole::InterruptIn => &self.interrupt_in,
            EndpointRole::BulkIn => &self.bulk_in,
            EndpointRole::BulkOut => &self.bulk_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(address: u8, kind: TransferKind, max_packet_size: u16) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            kind,
            max_packet_size,
            interval: 1,
        }
    }

    #[test]
    fn test_scan_board_endpoints() {
        let table = EndpointTable::scan(&[
            desc(0x81, TransferKind::Interrupt, 1),
            desc(0x06, TransferKind::Bulk, 512),
            desc(0x88, TransferKind::Bulk, 512),
        ])
        .unwrap();

        assert_eq!(table.interrupt_in.address, 0x81);
        assert_eq!(table.bulk_out.address, 0x06);
        assert_eq!(table.bulk_in.address, 0x88);
        assert_eq!(table.get(EndpointRole::BulkIn).max_packet_size, 512);
    }

    #[test]
    fn test_last_candidate_wins() {
        let table = EndpointTable::scan(&[
            desc(0x81, TransferKind::Interrupt, 1),
            desc(0x82, TransferKind::Bulk, 64),
            desc(0x88, TransferKind::Bulk, 512),
            desc(0x06, TransferKind::Bulk, 512),
        ])
        .unwrap();

        assert_eq!(table.bulk_in.address, 0x88);
    }

    #[test]
    fn test_missing_endpoint() {
        let err = EndpointTable::scan(&[
            desc(0x81, TransferKind::Interrupt, 1),
            desc(0x06, TransferKind::Bulk, 512),
        ])
        .unwrap_err();
        assert!(matches!(err, DriverError::MissingEndpoint(EndpointRole::BulkIn)));

        // Interrupt-out and isochronous endpoints do not count
        let err = EndpointTable::scan(&[
            desc(0x01, TransferKind::Interrupt, 1),
            desc(0x83, TransferKind::Isochronous, 1024),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            DriverError::MissingEndpoint(EndpointRole::InterruptIn)
        ));
    }
}
