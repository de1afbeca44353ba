//! Transfer manager
//!
//! Owns the device's transfer objects and buffers:
//!
//! - the 1-byte interrupt-in transfer that reports switch changes and
//!   re-arms itself from its completion callback,
//! - the bulk-out queue, where every write gets its own buffer that lives
//!   until the write completes,
//! - the bulk-in buffer used by blocking reads.

use crate::bus::UsbBus;
use crate::context::SwitchMonitor;
use crate::endpoints::EndpointTable;
use crate::error::{DriverError, Result};
use crate::sync::lock;
use crate::urb::{BulkOutPipe, Completion, InterruptUrb, Resubmitter, TransferStatus};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Timeouts and queue sizes for the device's transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bound on a blocking bulk read
    pub bulk_read_timeout: Duration,
    /// Bound on a single queued bulk write
    pub bulk_write_timeout: Duration,
    /// Bound on a vendor control request
    pub control_timeout: Duration,
    /// How often a pending interrupt read re-checks for cancellation
    pub interrupt_poll: Duration,
    /// Bulk writes that may be queued before submission fails
    pub bulk_write_queue_depth: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bulk_read_timeout: Duration::from_secs(10),
            bulk_write_timeout: Duration::from_secs(5),
            control_timeout: protocol::CONTROL_TIMEOUT,
            interrupt_poll: Duration::from_millis(100),
            bulk_write_queue_depth: 16,
        }
    }
}

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting
fn alloc_buffer(len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|e| DriverError::ResourceExhausted(format!("{} buffer: {}", what, e)))?;
    buffer.resize(len, 0);
    Ok(buffer)
}

pub struct TransferManager {
    bus: Arc<dyn UsbBus>,
    endpoints: EndpointTable,
    config: TransferConfig,
    interrupt: InterruptUrb,
    bulk_out: BulkOutPipe,
    bulk_in_buffer: Mutex<Vec<u8>>,
    pending: Arc<AtomicI64>,
}

impl TransferManager {
    /// Allocate every buffer and transfer object for one device
    ///
    /// Switch bytes delivered by the interrupt transfer go to `switches`.
    /// `pending` is the diagnostic count of bytes written but not read back.
    pub fn new(
        bus: Arc<dyn UsbBus>,
        endpoints: EndpointTable,
        config: TransferConfig,
        switches: Arc<SwitchMonitor>,
        pending: Arc<AtomicI64>,
    ) -> Result<Self> {
        // One switch byte, whatever the endpoint's declared packet size
        let interrupt_buffer = alloc_buffer(1, "interrupt")?;
        let bulk_in_buffer = alloc_buffer(usize::from(endpoints.bulk_in.max_packet_size), "bulk-in")?;

        let endpoint = endpoints.interrupt_in.address;
        let interrupt = InterruptUrb::new(
            Arc::clone(&bus),
            endpoint,
            interrupt_buffer,
            config.interrupt_poll,
            Box::new(move |completion, resubmitter| {
                interrupt_complete(&switches, endpoint, completion, resubmitter)
            }),
        )?;

        let bulk_out = BulkOutPipe::new(
            Arc::clone(&bus),
            endpoints.bulk_out.address,
            config.bulk_write_timeout,
            config.bulk_write_queue_depth,
        )?;

        Ok(Self {
            bus,
            endpoints,
            config,
            interrupt,
            bulk_out,
            bulk_in_buffer: Mutex::new(bulk_in_buffer),
            pending,
        })
    }

    /// Arm the self-resubmitting switch monitor
    pub fn submit_interrupt(&self) -> Result<()> {
        self.interrupt.submit().inspect_err(|e| {
            error!(
                "Failed to submit interrupt transfer on {:#04x}: {}",
                self.endpoints.interrupt_in.address, e
            );
        })
    }

    /// Queue `data` on the bulk-out endpoint without waiting for completion
    ///
    /// Returns the number of bytes accepted for transmission.
    pub fn submit_bulk_write(&self, data: &[u8]) -> Result<usize> {
        let mut buffer = alloc_buffer(data.len(), "bulk-out")?;
        buffer.copy_from_slice(data);
        let len = data.len();

        let endpoint = self.endpoints.bulk_out.address;
        self.bulk_out
            .submit(
                buffer,
                Box::new(move |completion| match completion.status {
                    TransferStatus::Completed => {
                        debug!(
                            "Bulk write on {:#04x} completed: {} bytes",
                            endpoint, completion.actual_length
                        );
                    }
                    status if status.is_benign() => {
                        debug!("Bulk write on {:#04x} ended: {:?}", endpoint, status);
                    }
                    status => {
                        error!("Bulk write on {:#04x} failed: {:?}", endpoint, status);
                    }
                }),
            )
            .inspect_err(|e| error!("Failed to submit bulk write: {}", e))?;

        self.pending.fetch_add(len as i64, Ordering::SeqCst);
        Ok(len)
    }

    /// Blocking bulk read of up to `min(bulk-in packet size, buf.len())` bytes
    pub fn bulk_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut bulk_in = lock(&self.bulk_in_buffer);
        let len = bulk_in.len().min(buf.len());

        let count = self
            .bus
            .read_bulk(
                self.endpoints.bulk_in.address,
                &mut bulk_in[..len],
                self.config.bulk_read_timeout,
            )
            .map_err(|e| {
                debug!("Bulk read failed: {}", e);
                DriverError::from_transfer(e)
            })?;

        buf[..count].copy_from_slice(&bulk_in[..count]);
        self.pending.fetch_sub(count as i64, Ordering::SeqCst);
        Ok(count)
    }

    /// Cancel the interrupt transfer and wait for its callback to finish
    pub fn cancel_all(&self) {
        self.interrupt.kill();
    }

    /// Cancel the interrupt transfer and refuse to re-arm it from now on
    pub fn shutdown(&self) {
        self.interrupt.retire();
    }

    pub fn interrupt_active(&self) -> bool {
        self.interrupt.is_active()
    }

    /// Bulk writes waiting in the queue
    pub fn queued_writes(&self) -> usize {
        self.bulk_out.queued()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }
}

fn interrupt_complete(
    switches: &SwitchMonitor,
    endpoint: u8,
    completion: Completion<'_>,
    resubmitter: &Resubmitter,
) {
    match completion.status {
        TransferStatus::Completed => {
            if let Some(&state) = completion.data.first() {
                trace!("Switch state {:#04x}", state);
                switches.update(state);
            }
            if let Err(e) = resubmitter.submit() {
                error!(
                    "Failed to resubmit interrupt transfer on {:#04x}: {}",
                    endpoint, e
                );
            }
        }
        status if status.is_benign() => {
            debug!("Interrupt transfer on {:#04x} stopped: {:?}", endpoint, status);
        }
        status => {
            warn!(
                "Interrupt transfer on {:#04x} failed: {:?}; switch monitoring paused",
                endpoint, status
            );
        }
    }
}
