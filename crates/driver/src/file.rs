//! Character-stream handle on the loopback channel
//!
//! A [`DeviceFile`] is what an `open` of `/dev/osrfx2_<n>` yields: it holds
//! a reference to the device context and the bulk slots of its access
//! mode. The slots are released when the handle is closed or dropped; the
//! context may outlive the device's detach until then.

use crate::context::DeviceContext;
use crate::error::{DriverError, Result};
use crate::gate::{AccessMode, BulkClaim};
use std::io;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct DeviceFile {
    ctx: Arc<DeviceContext>,
    claim: Option<BulkClaim>,
    mode: AccessMode,
}

impl DeviceFile {
    /// Open the device's loopback channel
    ///
    /// Fails with [`DriverError::Busy`] when another handle already holds a
    /// requested direction.
    pub fn open(ctx: Arc<DeviceContext>, mode: AccessMode) -> Result<Self> {
        ctx.ensure_attached()?;
        let claim = ctx.gate().acquire(mode, ctx.bus(), ctx.endpoints())?;

        debug!("{}: opened for {}", ctx.name(), mode);
        Ok(Self {
            ctx,
            claim: Some(claim),
            mode,
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Blocking read of up to one bulk-in packet
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.reads() {
            return Err(DriverError::WrongAccessMode("reading"));
        }
        self.ctx.ensure_attached()?;

        self.ctx.transfers().bulk_read(buf)
    }

    /// Queue `data` for the bulk-out endpoint and return without waiting
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.mode.writes() {
            return Err(DriverError::WrongAccessMode("writing"));
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.ctx.ensure_attached()?;

        self.ctx.transfers().submit_bulk_write(data)
    }

    /// Release the bulk slots and the context reference
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        if let Some(claim) = self.claim.take() {
            self.ctx.gate().release(claim);
        }
        debug!("{}: closed", self.ctx.name());
    }
}

impl io::Read for DeviceFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DeviceFile::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for DeviceFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        DeviceFile::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SimulatedFx2;
    use crate::transfers::TransferConfig;
    use std::time::Duration;

    fn context(sim: &SimulatedFx2) -> Arc<DeviceContext> {
        let config = TransferConfig {
            bulk_read_timeout: Duration::from_millis(100),
            ..TransferConfig::default()
        };
        DeviceContext::create(192, "osrfx2_0".to_string(), sim.bus(), config).unwrap()
    }

    #[test]
    fn test_loopback_through_handles() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);

        let writer = DeviceFile::open(Arc::clone(&ctx), AccessMode::Write).unwrap();
        let reader = DeviceFile::open(Arc::clone(&ctx), AccessMode::Read).unwrap();

        assert_eq!(writer.write(b"Test packet 0").unwrap(), 13);
        let mut buf = [0u8; 512];
        let count = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"Test packet 0");
    }

    #[test]
    fn test_wrong_direction() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);

        let reader = DeviceFile::open(Arc::clone(&ctx), AccessMode::Read).unwrap();
        assert!(matches!(
            reader.write(b"x"),
            Err(DriverError::WrongAccessMode(_))
        ));
    }

    #[test]
    fn test_empty_write_submits_nothing() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);

        let writer = DeviceFile::open(Arc::clone(&ctx), AccessMode::Write).unwrap();
        assert_eq!(writer.write(&[]).unwrap(), 0);
        assert_eq!(ctx.pending_bytes(), 0);
        assert_eq!(sim.loopback_bytes(), 0);
    }

    #[test]
    fn test_close_releases_slots() {
        let sim = SimulatedFx2::new();
        let ctx = context(&sim);

        let file = DeviceFile::open(Arc::clone(&ctx), AccessMode::ReadWrite).unwrap();
        assert!(matches!(
            DeviceFile::open(Arc::clone(&ctx), AccessMode::Read),
            Err(DriverError::Busy)
        ));

        file.close();
        assert!(!ctx.gate().is_read_held());
        assert!(!ctx.gate().is_write_held());
        assert!(DeviceFile::open(ctx, AccessMode::Read).is_ok());
    }

    #[test]
    fn test_io_traits() {
        use std::io::{Read, Write};

        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let mut file = DeviceFile::open(ctx, AccessMode::ReadWrite).unwrap();

        file.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_read_timeout_maps_to_io_kind() {
        use std::io::Read;

        let sim = SimulatedFx2::new();
        let ctx = context(&sim);
        let mut file = DeviceFile::open(ctx, AccessMode::Read).unwrap();

        let mut buf = [0u8; 4];
        let err = Read::read(&mut file, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
