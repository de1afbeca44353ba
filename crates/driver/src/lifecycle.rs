//! Driver registration and device attach/detach
//!
//! [`Driver`] is the single entry point for the process: it is registered
//! once with its id table, attaches devices handed to it by the bus layer,
//! publishes them under minor numbers starting at [`MINOR_BASE`], and
//! detaches them again. Dropping the driver (or [`Driver::deregister`])
//! detaches whatever is still attached.

use crate::attributes::DeviceAttributes;
use crate::bus::UsbBus;
use crate::context::DeviceContext;
use crate::error::{DriverError, Result};
use crate::file::DeviceFile;
use crate::gate::AccessMode;
use crate::power::SignalFlag;
use crate::sync::lock;
use crate::transfers::TransferConfig;
use protocol::{DeviceInfo, DeviceStatus, PRODUCT_ID, VENDOR_ID};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// First minor number handed out to attached boards
pub const MINOR_BASE: u32 = 192;

/// Highest minor number (exclusive) of the character-device range
const MINOR_LIMIT: u32 = 256;

/// Prefix of published device names
pub const DRIVER_NAME: &str = "osrfx2";

/// One entry of the driver's id table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMatch {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceMatch {
    /// OSR USB-FX2 learning kit
    pub const OSRFX2: DeviceMatch = DeviceMatch {
        vendor_id: VENDOR_ID,
        product_id: PRODUCT_ID,
    };

    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vendor_id == info.vendor_id && self.product_id == info.product_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Devices this driver binds to
    pub ids: Vec<DeviceMatch>,
    pub transfers: TransferConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            ids: vec![DeviceMatch::OSRFX2],
            transfers: TransferConfig::default(),
        }
    }
}

/// Published name for a minor number (`osrfx2_0` for minor 192)
pub fn device_name(minor: u32) -> String {
    format!("{}_{}", DRIVER_NAME, minor.saturating_sub(MINOR_BASE))
}

/// Minor number for a published name
pub fn minor_for_name(name: &str) -> Option<u32> {
    let index: u32 = name
        .strip_prefix(DRIVER_NAME)?
        .strip_prefix('_')?
        .parse()
        .ok()?;
    MINOR_BASE.checked_add(index).filter(|m| *m < MINOR_LIMIT)
}

#[derive(Default)]
struct Registry {
    published: BTreeMap<u32, Arc<DeviceContext>>,
    /// Minors taken by attaches still in progress
    reserved: BTreeSet<u32>,
}

impl Registry {
    fn reserve_minor(&mut self) -> Option<u32> {
        let minor = (MINOR_BASE..MINOR_LIMIT)
            .find(|m| !self.published.contains_key(m) && !self.reserved.contains(m))?;
        self.reserved.insert(minor);
        Some(minor)
    }
}

pub struct Driver {
    config: DriverConfig,
    registry: Mutex<Registry>,
}

impl Driver {
    /// Register the driver with its id table
    pub fn register(config: DriverConfig) -> Self {
        for id in &config.ids {
            debug!(
                "Matching devices {:04x}:{:04x}",
                id.vendor_id, id.product_id
            );
        }
        info!("{} driver registered", DRIVER_NAME);

        Self {
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Whether `info` is in the id table
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.config.ids.iter().any(|id| id.matches(info))
    }

    /// Bind to a device and publish it; returns its minor number
    ///
    /// The interrupt transfer is running before the device becomes
    /// visible. On failure nothing is published and every resource taken
    /// so far is released.
    pub fn attach(&self, bus: Arc<dyn UsbBus>) -> Result<u32> {
        let info = bus.info();
        if !self.matches(&info) {
            return Err(DriverError::NotMatched {
                vendor_id: info.vendor_id,
                product_id: info.product_id,
            });
        }

        let minor = lock(&self.registry)
            .reserve_minor()
            .ok_or_else(|| DriverError::ResourceExhausted("no free minor number".to_string()))?;

        match self.bring_up(minor, bus) {
            Ok(ctx) => {
                let mut registry = lock(&self.registry);
                registry.reserved.remove(&minor);
                registry.published.insert(minor, ctx);

                info!(
                    "{} attached ({:04x}:{:04x} on bus {:03} device {:03}) as minor {}",
                    device_name(minor),
                    info.vendor_id,
                    info.product_id,
                    info.bus_number,
                    info.device_address,
                    minor
                );
                Ok(minor)
            }
            Err(e) => {
                lock(&self.registry).reserved.remove(&minor);
                warn!("Failed to attach {:04x}:{:04x}: {}", info.vendor_id, info.product_id, e);
                Err(e)
            }
        }
    }

    fn bring_up(&self, minor: u32, bus: Arc<dyn UsbBus>) -> Result<Arc<DeviceContext>> {
        let ctx = DeviceContext::create(
            minor,
            device_name(minor),
            bus,
            self.config.transfers.clone(),
        )?;
        ctx.transfers().submit_interrupt()?;
        Ok(ctx)
    }

    /// Unbind a device
    ///
    /// No new opens are possible once this starts. The context itself is
    /// destroyed when the last open handle on it is closed.
    pub fn detach(&self, minor: u32) -> Result<()> {
        let ctx = lock(&self.registry)
            .published
            .remove(&minor)
            .ok_or(DriverError::UnknownMinor(minor))?;

        ctx.disconnect();
        ctx.transfers().shutdown();
        ctx.switches().close();

        let handles = DeviceContext::references(&ctx) - 1;
        info!(
            "{} detached ({} open handle(s) remaining)",
            ctx.name(),
            handles
        );
        Ok(())
    }

    /// Published context for `minor`
    pub fn context(&self, minor: u32) -> Result<Arc<DeviceContext>> {
        lock(&self.registry)
            .published
            .get(&minor)
            .cloned()
            .ok_or(DriverError::UnknownMinor(minor))
    }

    /// Minors of all published devices, ascending
    pub fn minors(&self) -> Vec<u32> {
        lock(&self.registry).published.keys().copied().collect()
    }

    pub fn open(&self, minor: u32, mode: AccessMode) -> Result<DeviceFile> {
        DeviceFile::open(self.context(minor)?, mode)
    }

    /// Open by published name, e.g. `osrfx2_0`
    pub fn open_by_name(&self, name: &str, mode: AccessMode) -> Result<DeviceFile> {
        let minor =
            minor_for_name(name).ok_or_else(|| DriverError::UnknownDevice(name.to_string()))?;
        self.open(minor, mode)
    }

    pub fn attributes(&self, minor: u32) -> Result<DeviceAttributes> {
        Ok(DeviceAttributes::new(self.context(minor)?))
    }

    pub fn status(&self, minor: u32) -> Result<DeviceStatus> {
        Ok(DeviceContext::status(&self.context(minor)?))
    }

    pub fn suspend(&self, minor: u32, signal: &SignalFlag) -> Result<()> {
        self.context(minor)?.suspend(signal)
    }

    pub fn resume(&self, minor: u32, signal: &SignalFlag) -> Result<()> {
        self.context(minor)?.resume(signal)
    }

    /// Detach every device and unregister
    pub fn deregister(self) {
        drop(self);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        let minors = self.minors();
        for minor in minors {
            if let Err(e) = self.detach(minor) {
                warn!("Failed to detach minor {} at deregistration: {}", minor, e);
            }
        }
        info!("{} driver deregistered", DRIVER_NAME);
    }
}
