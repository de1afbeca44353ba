//! Suspend/resume state machine
//!
//! Two states, `Active` and `Suspended`. Transitions are serialized by a
//! power lock whose acquisition can be abandoned when the caller is
//! signalled; a transition that cannot get the lock is not queued.
//!
//! ```text
//!            suspend: cancel interrupt, suspended = true
//!   Active ───────────────────────────────────────────► Suspended
//!      ▲                                                    │
//!      └────────────────────────────────────────────────────┘
//!            resume: suspended = false, resubmit interrupt
//! ```

use crate::error::{DriverError, Result};
use crate::sync::{lock, wait_timeout};
use crate::transfers::TransferManager;
use protocol::UsbError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// How often a blocked lock acquisition re-checks its signal flag
const SIGNAL_POLL: Duration = Duration::from_millis(10);

/// Pending-signal flag of the thread driving a power transition
///
/// Raising it makes a blocked [`PowerState::suspend`] or
/// [`PowerState::resume`] give up with [`DriverError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct SignalFlag(Arc<AtomicBool>);

impl SignalFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Active,
    Suspended,
}

#[derive(Debug, Default)]
struct PowerLock {
    held: Mutex<bool>,
    released: Condvar,
}

struct PowerGuard<'a> {
    lock: &'a PowerLock,
}

impl PowerLock {
    /// Take the lock, or fail once `signal` is raised while waiting
    fn lock_interruptible(&self, signal: &SignalFlag) -> Result<PowerGuard<'_>> {
        let mut held = lock(&self.held);
        loop {
            if !*held {
                *held = true;
                return Ok(PowerGuard { lock: self });
            }
            if signal.is_raised() {
                debug!("Power lock wait interrupted");
                return Err(DriverError::Interrupted);
            }
            held = wait_timeout(&self.released, held, SIGNAL_POLL).0;
        }
    }
}

impl Drop for PowerGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.lock.held) = false;
        self.lock.released.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct PowerState {
    lock: PowerLock,
    suspended: AtomicBool,
}

impl PowerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> PowerMode {
        if self.is_suspended() {
            PowerMode::Suspended
        } else {
            PowerMode::Active
        }
    }

    /// Active → Suspended: stop switch monitoring
    pub fn suspend(&self, transfers: &TransferManager, signal: &SignalFlag) -> Result<()> {
        let _guard = self.lock.lock_interruptible(signal)?;

        transfers.cancel_all();
        self.suspended.store(true, Ordering::SeqCst);

        info!("Device suspended");
        Ok(())
    }

    /// Suspended → Active: restart switch monitoring
    ///
    /// Failing to re-arm the interrupt transfer is logged but does not fail
    /// the transition; control and bulk traffic keep working.
    pub fn resume(&self, transfers: &TransferManager, signal: &SignalFlag) -> Result<()> {
        let _guard = self.lock.lock_interruptible(signal)?;

        self.suspended.store(false, Ordering::SeqCst);

        match transfers.submit_interrupt() {
            Ok(()) => info!("Device resumed"),
            Err(DriverError::TransferFailed(UsbError::Busy)) => {
                debug!("Switch monitoring already running");
            }
            Err(DriverError::TransferFailed(UsbError::HostUnreachable)) => {
                error!("Resume could not re-arm switch monitoring: parent hub/port still suspended");
            }
            Err(e) => error!("Resume could not re-arm switch monitoring: {}", e),
        }

        Ok(())
    }
}
