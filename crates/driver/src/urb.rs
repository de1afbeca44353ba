//! Asynchronous transfer objects
//!
//! [`UsbBus`] only offers blocking transfers, so each asynchronous transfer
//! object owns a worker thread that performs the blocking call and then runs
//! the completion callback on its own thread, the way a host controller
//! completes requests from interrupt context.
//!
//! - [`InterruptUrb`]: one reusable interrupt-in request. It is submitted,
//!   completes once, and may be resubmitted from its own completion
//!   callback. [`InterruptUrb::kill`] cancels it and blocks until no
//!   callback is running or can start.
//! - [`BulkOutPipe`]: a queue of one-shot bulk-out requests, each owning its
//!   buffer until its completion callback has run.

use crate::bus::UsbBus;
use crate::error::{DriverError, Result};
use crate::sync::{lock, wait};
use protocol::UsbError;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Final status delivered to a completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished and `data` holds what the device sent
    Completed,
    /// Cancelled by the host before completing
    Unlinked,
    /// Device went away while the transfer was queued
    Shutdown,
    /// Any other failure
    Failed(UsbError),
}

impl TransferStatus {
    pub fn from_error(error: UsbError) -> Self {
        match error {
            UsbError::NoDevice => TransferStatus::Shutdown,
            other => TransferStatus::Failed(other),
        }
    }

    /// Statuses that are an expected part of teardown rather than faults
    pub fn is_benign(&self) -> bool {
        matches!(self, TransferStatus::Unlinked | TransferStatus::Shutdown)
    }
}

/// Result of one interrupt transfer, as seen by the completion callback
#[derive(Debug)]
pub struct Completion<'a> {
    pub status: TransferStatus,
    /// Bytes received; empty unless `status` is `Completed`
    pub data: &'a [u8],
}

/// Interrupt completion callback
pub type InterruptHandler = Box<dyn FnMut(Completion<'_>, &Resubmitter) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Submitted, not yet picked up by the worker
    Pending,
    /// Worker is blocked in the bus call
    InFlight,
    /// Completion callback is running
    Completing,
}

#[derive(Debug)]
struct UrbState {
    phase: Phase,
    /// Number of kills in progress; submission is refused while non-zero
    reject: usize,
    cancel: bool,
    /// Set once the device is gone; every later submission fails
    retired: bool,
    shutdown: bool,
}

struct UrbShared {
    state: Mutex<UrbState>,
    changed: Condvar,
    bus: Arc<dyn UsbBus>,
    endpoint: u8,
}

impl UrbShared {
    fn submit(&self) -> Result<()> {
        let mut state = lock(&self.state);

        if state.reject > 0 {
            return Err(DriverError::TransferFailed(UsbError::Access));
        }
        if state.retired || state.shutdown {
            return Err(DriverError::NoDevice);
        }
        if matches!(state.phase, Phase::Pending | Phase::InFlight) {
            return Err(DriverError::TransferFailed(UsbError::Busy));
        }

        self.bus
            .ensure_reachable()
            .map_err(DriverError::TransferFailed)?;

        state.phase = Phase::Pending;
        self.changed.notify_all();
        Ok(())
    }
}

/// Handle passed to a completion callback for re-arming its transfer
pub struct Resubmitter {
    shared: Arc<UrbShared>,
}

impl Resubmitter {
    pub fn submit(&self) -> Result<()> {
        self.shared.submit()
    }
}

/// Reusable interrupt-in transfer with a dedicated completion thread
pub struct InterruptUrb {
    shared: Arc<UrbShared>,
    worker: Option<JoinHandle<()>>,
}

impl InterruptUrb {
    /// Create the transfer object for `endpoint`, reading into `buffer`
    ///
    /// The buffer length is the transfer length. `poll` bounds how long a
    /// single bus read blocks before the worker re-checks for cancellation.
    pub fn new(
        bus: Arc<dyn UsbBus>,
        endpoint: u8,
        buffer: Vec<u8>,
        poll: Duration,
        handler: InterruptHandler,
    ) -> Result<Self> {
        let shared = Arc::new(UrbShared {
            state: Mutex::new(UrbState {
                phase: Phase::Idle,
                reject: 0,
                cancel: false,
                retired: false,
                shutdown: false,
            }),
            changed: Condvar::new(),
            bus,
            endpoint,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("urb-int-{:02x}", endpoint))
            .spawn(move || interrupt_worker(worker_shared, buffer, poll, handler))
            .map_err(|e| {
                DriverError::ResourceExhausted(format!("interrupt transfer thread: {}", e))
            })?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn submit(&self) -> Result<()> {
        self.shared.submit()
    }

    /// Cancel the transfer and wait until its completion callback has returned
    ///
    /// Submissions made while the kill is in progress (including from the
    /// callback itself) are refused. Must not be called from the completion
    /// callback.
    pub fn kill(&self) {
        let mut state = lock(&self.shared.state);
        state.reject += 1;
        state.cancel = true;
        self.shared.changed.notify_all();

        while state.phase != Phase::Idle {
            state = wait(&self.shared.changed, state);
        }

        state.reject -= 1;
        if state.reject == 0 {
            state.cancel = false;
        }
    }

    /// Kill the transfer for good
    ///
    /// Like [`kill`](Self::kill), but submissions keep failing with
    /// [`DriverError::NoDevice`] afterwards.
    pub fn retire(&self) {
        lock(&self.shared.state).retired = true;
        self.kill();
    }

    /// Whether the transfer is submitted or its callback is running
    pub fn is_active(&self) -> bool {
        lock(&self.shared.state).phase != Phase::Idle
    }

    pub fn endpoint(&self) -> u8 {
        self.shared.endpoint
    }
}

impl Drop for InterruptUrb {
    fn drop(&mut self) {
        self.kill();

        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            self.shared.changed.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(
                    "Interrupt worker for endpoint {:#04x} panicked",
                    self.shared.endpoint
                );
            }
        }
    }
}

fn interrupt_worker(
    shared: Arc<UrbShared>,
    mut buffer: Vec<u8>,
    poll: Duration,
    mut handler: InterruptHandler,
) {
    let resubmitter = Resubmitter {
        shared: Arc::clone(&shared),
    };

    loop {
        {
            let mut state = lock(&shared.state);
            while state.phase != Phase::Pending && !state.shutdown {
                state = wait(&shared.changed, state);
            }
            if state.shutdown {
                break;
            }
            state.phase = Phase::InFlight;
        }

        let (status, len) = run_interrupt_read(&shared, &mut buffer, poll);
        trace!(
            "Interrupt transfer on {:#04x} finished: {:?}",
            shared.endpoint, status
        );

        lock(&shared.state).phase = Phase::Completing;

        let data = match status {
            TransferStatus::Completed => &buffer[..len],
            _ => &buffer[..0],
        };
        let completed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler(Completion { status, data }, &resubmitter)
        }));
        if completed.is_err() {
            error!(
                "Panic in interrupt completion for endpoint {:#04x}",
                shared.endpoint
            );
        }

        let mut state = lock(&shared.state);
        if state.phase == Phase::Completing {
            state.phase = Phase::Idle;
        }
        shared.changed.notify_all();
    }

    debug!("Interrupt worker for {:#04x} stopped", shared.endpoint);
}

fn run_interrupt_read(
    shared: &UrbShared,
    buffer: &mut [u8],
    poll: Duration,
) -> (TransferStatus, usize) {
    loop {
        if lock(&shared.state).cancel {
            return (TransferStatus::Unlinked, 0);
        }

        match shared.bus.read_interrupt(shared.endpoint, buffer, poll) {
            Ok(len) => return (TransferStatus::Completed, len),
            Err(UsbError::Timeout) => continue,
            Err(e) => return (TransferStatus::from_error(e), 0),
        }
    }
}

/// Result of one bulk-out transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOutCompletion {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Bulk-out completion callback
pub type BulkOutHandler = Box<dyn FnOnce(BulkOutCompletion) + Send>;

struct BulkOutRequest {
    buffer: Vec<u8>,
    on_complete: BulkOutHandler,
}

/// Queue of one-shot bulk-out transfers served by a worker thread
pub struct BulkOutPipe {
    endpoint: u8,
    tx: async_channel::Sender<BulkOutRequest>,
    worker: Option<JoinHandle<()>>,
}

impl BulkOutPipe {
    pub fn new(
        bus: Arc<dyn UsbBus>,
        endpoint: u8,
        timeout: Duration,
        queue_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = async_channel::bounded::<BulkOutRequest>(queue_depth.max(1));

        let worker = thread::Builder::new()
            .name(format!("urb-bulk-{:02x}", endpoint))
            .spawn(move || {
                while let Ok(request) = rx.recv_blocking() {
                    let BulkOutRequest {
                        buffer,
                        on_complete,
                    } = request;

                    let completion = match bus.write_bulk(endpoint, &buffer, timeout) {
                        Ok(actual_length) => BulkOutCompletion {
                            status: TransferStatus::Completed,
                            actual_length,
                        },
                        Err(e) => BulkOutCompletion {
                            status: TransferStatus::from_error(e),
                            actual_length: 0,
                        },
                    };

                    on_complete(completion);
                    drop(buffer);
                }
                debug!("Bulk-out worker for {:#04x} stopped", endpoint);
            })
            .map_err(|e| DriverError::ResourceExhausted(format!("bulk-out thread: {}", e)))?;

        Ok(Self {
            endpoint,
            tx,
            worker: Some(worker),
        })
    }

    /// Queue `buffer` for transmission; ownership passes to the transfer
    pub fn submit(&self, buffer: Vec<u8>, on_complete: BulkOutHandler) -> Result<()> {
        self.tx
            .try_send(BulkOutRequest {
                buffer,
                on_complete,
            })
            .map_err(|e| match e {
                async_channel::TrySendError::Full(_) => DriverError::ResourceExhausted(format!(
                    "bulk-out queue for {:#04x} is full",
                    self.endpoint
                )),
                async_channel::TrySendError::Closed(_) => DriverError::NoDevice,
            })
    }

    /// Number of transfers queued but not yet started
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

impl Drop for BulkOutPipe {
    fn drop(&mut self) {
        // Queued requests still complete before the worker exits
        self.tx.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Bulk-out worker for {:#04x} panicked", self.endpoint);
            }
        }
    }
}
