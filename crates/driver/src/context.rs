//! Per-device context
//!
//! A [`DeviceContext`] is shared through `Arc`: the lifecycle controller
//! holds one reference while the device is published, and every open
//! [`DeviceFile`](crate::DeviceFile) holds another. Dropping the last
//! reference tears the device down: the interrupt transfer is cancelled
//! and waited for, the transfer workers are joined, the buffers are freed
//! and the bus handle is released.

use crate::bus::UsbBus;
use crate::endpoints::EndpointTable;
use crate::error::{DriverError, Result};
use crate::gate::AccessGate;
use crate::power::{PowerMode, PowerState, SignalFlag};
use crate::sync::{lock, wait_timeout};
use crate::transfers::{TransferConfig, TransferManager};
use crate::vendor::VendorControlFacade;
use protocol::DeviceStatus;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Capacity of each async switch subscription
const SUBSCRIBER_QUEUE: usize = 32;

/// One switch-state delivery from the interrupt endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEvent {
    /// Raw switch byte as reported by the device
    pub state: u8,
    /// Number of deliveries so far, including this one
    pub generation: u64,
}

#[derive(Debug, Default)]
struct SwitchSnapshot {
    state: u8,
    generation: u64,
}

/// Mirror of the switch bank plus the switch-change signal
///
/// Written only by the interrupt completion; any number of threads may
/// wait for changes, and async consumers may subscribe to a channel.
#[derive(Debug, Default)]
pub struct SwitchMonitor {
    snapshot: Mutex<SwitchSnapshot>,
    changed: Condvar,
    subscribers: Mutex<Subscribers>,
}

#[derive(Debug, Default)]
struct Subscribers {
    senders: Vec<async_channel::Sender<SwitchEvent>>,
    closed: bool,
}

impl SwitchMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new switch byte and wake everyone waiting for a change
    pub fn update(&self, state: u8) {
        let event = {
            let mut snapshot = lock(&self.snapshot);
            snapshot.state = state;
            snapshot.generation += 1;
            SwitchEvent {
                state,
                generation: snapshot.generation,
            }
        };
        self.changed.notify_all();

        let mut subscribers = lock(&self.subscribers);
        subscribers.senders.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            // Slow consumer; it will see a later event
            Err(async_channel::TrySendError::Full(_)) => true,
            Err(async_channel::TrySendError::Closed(_)) => false,
        });
    }

    pub fn current(&self) -> u8 {
        lock(&self.snapshot).state
    }

    pub fn latest(&self) -> SwitchEvent {
        let snapshot = lock(&self.snapshot);
        SwitchEvent {
            state: snapshot.state,
            generation: snapshot.generation,
        }
    }

    /// Block until a delivery newer than `seen_generation`, or time out
    pub fn wait_change(&self, seen_generation: u64, timeout: Duration) -> Option<SwitchEvent> {
        let deadline = Instant::now() + timeout;
        let mut snapshot = lock(&self.snapshot);

        while snapshot.generation <= seen_generation {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            snapshot = wait_timeout(&self.changed, snapshot, deadline - now).0;
        }

        Some(SwitchEvent {
            state: snapshot.state,
            generation: snapshot.generation,
        })
    }

    /// Receive every future delivery on an async channel
    ///
    /// The channel closes once the device is detached.
    pub fn subscribe(&self) -> async_channel::Receiver<SwitchEvent> {
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_QUEUE);
        let mut subscribers = lock(&self.subscribers);
        if !subscribers.closed {
            subscribers.senders.push(tx);
        }
        rx
    }

    /// Close every subscription, current and future
    pub fn close(&self) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.closed = true;
        subscribers.senders.clear();
    }
}

pub struct DeviceContext {
    name: String,
    minor: u32,
    bus: Arc<dyn UsbBus>,
    /// Claimed interface; cleared once, at detach
    interface: Mutex<Option<u8>>,
    transfers: TransferManager,
    switches: Arc<SwitchMonitor>,
    /// Output mirrors, in wire bit order
    segments: AtomicU8,
    leds: AtomicU8,
    gate: AccessGate,
    power: PowerState,
    pending: Arc<AtomicI64>,
}

impl DeviceContext {
    /// Build the context for a freshly attached device
    ///
    /// Scans the interface's endpoints and allocates every buffer and
    /// transfer object. Nothing is submitted yet. On failure everything
    /// allocated so far is released again.
    pub fn create(
        minor: u32,
        name: String,
        bus: Arc<dyn UsbBus>,
        config: TransferConfig,
    ) -> Result<Arc<Self>> {
        let endpoints = EndpointTable::scan(&bus.endpoints())?;
        let switches = Arc::new(SwitchMonitor::new());
        let pending = Arc::new(AtomicI64::new(0));

        let transfers = TransferManager::new(
            Arc::clone(&bus),
            endpoints,
            config,
            Arc::clone(&switches),
            Arc::clone(&pending),
        )?;

        debug!(
            "Created context {} (interrupt {:#04x}, bulk-in {:#04x}, bulk-out {:#04x})",
            name,
            endpoints.interrupt_in.address,
            endpoints.bulk_in.address,
            endpoints.bulk_out.address
        );

        Ok(Arc::new(Self {
            name,
            minor,
            interface: Mutex::new(Some(bus.interface_number())),
            bus,
            transfers,
            switches,
            segments: AtomicU8::new(0),
            leds: AtomicU8::new(0),
            gate: AccessGate::new(),
            power: PowerState::new(),
            pending,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn bus(&self) -> &dyn UsbBus {
        &*self.bus
    }

    pub fn endpoints(&self) -> &EndpointTable {
        self.transfers.endpoints()
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn switches(&self) -> &SwitchMonitor {
        &self.switches
    }

    pub fn vendor(&self) -> VendorControlFacade<'_> {
        VendorControlFacade::new(self)
    }

    /// Whether the device is still attached
    pub fn is_attached(&self) -> bool {
        lock(&self.interface).is_some()
    }

    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(DriverError::NoDevice)
        }
    }

    /// Mark the interface as gone; returns false if it already was
    pub(crate) fn disconnect(&self) -> bool {
        let interface = lock(&self.interface).take();
        match interface {
            Some(number) => {
                debug!("{}: interface {} detached", self.name, number);
                true
            }
            None => false,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.power.is_suspended()
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power.mode()
    }

    /// Fails with [`DriverError::NoDevice`] once the device is detached
    pub fn suspend(&self, signal: &SignalFlag) -> Result<()> {
        self.ensure_attached()?;
        self.power.suspend(&self.transfers, signal)
    }

    /// Fails with [`DriverError::NoDevice`] once the device is detached
    pub fn resume(&self, signal: &SignalFlag) -> Result<()> {
        self.ensure_attached()?;
        self.power.resume(&self.transfers, signal)
    }

    /// Block until the switches change after `seen_generation`
    pub fn wait_switch_change(
        &self,
        seen_generation: u64,
        timeout: Duration,
    ) -> Option<SwitchEvent> {
        self.switches.wait_change(seen_generation, timeout)
    }

    pub fn subscribe_switches(&self) -> async_channel::Receiver<SwitchEvent> {
        self.switches.subscribe()
    }

    /// Bytes written to the loopback channel and not yet read back
    pub fn pending_bytes(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn segments_wire(&self) -> u8 {
        self.segments.load(Ordering::SeqCst)
    }

    pub(crate) fn set_segments_wire(&self, wire: u8) {
        self.segments.store(wire, Ordering::SeqCst);
    }

    pub(crate) fn leds_wire(&self) -> u8 {
        self.leds.load(Ordering::SeqCst)
    }

    pub(crate) fn set_leds_wire(&self, wire: u8) {
        self.leds.store(wire, Ordering::SeqCst);
    }

    /// Live references to this context
    pub fn references(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }

    /// Snapshot for the tooling; output reads that fail are shown as errors
    pub fn status(this: &Arc<Self>) -> DeviceStatus {
        let vendor = this.vendor();
        let show = |reading: Result<String>| reading.unwrap_or_else(|e| format!("error: {}", e));

        DeviceStatus {
            name: this.name.clone(),
            minor: this.minor,
            switches: vendor.read_switches().to_string(),
            bargraph: show(vendor.read_leds().map(|r| r.to_string())),
            segments: show(vendor.read_segments().map(|r| r.to_string())),
            suspended: this.is_suspended(),
            high_speed: vendor.is_high_speed().ok(),
            pending_bytes: this.pending_bytes(),
            references: Self::references(this),
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // No completion may run once the context is gone
        self.transfers.cancel_all();
        info!("{}: device context destroyed", self.name);
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.name)
            .field("minor", &self.minor)
            .field("attached", &self.is_attached())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}
