//! Tool configuration management

use anyhow::{Context, Result, anyhow};
use driver::{DeviceMatch, DriverConfig, TransferConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Osrfx2Config {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default log level when `RUST_LOG` is not set
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Which device to bind to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB vendor id, e.g. "0x0547"
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: String,
    /// USB product id, e.g. "0x1002"
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: String,
    /// Interface number to claim
    #[serde(default)]
    pub interface: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            interface: 0,
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> String {
        format!("{:#06x}", protocol::VENDOR_ID)
    }

    fn default_product_id() -> String {
        format!("{:#06x}", protocol::PRODUCT_ID)
    }
}

/// Transfer timeouts and queue sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "TransferSettings::default_bulk_read_timeout")]
    pub bulk_read_timeout_ms: u64,
    #[serde(default = "TransferSettings::default_control_timeout")]
    pub control_timeout_ms: u64,
    /// Granularity at which a pending interrupt read checks for cancellation
    #[serde(default = "TransferSettings::default_interrupt_poll")]
    pub interrupt_poll_ms: u64,
    #[serde(default = "TransferSettings::default_bulk_write_timeout")]
    pub bulk_write_timeout_ms: u64,
    #[serde(default = "TransferSettings::default_bulk_write_queue_depth")]
    pub bulk_write_queue_depth: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            bulk_read_timeout_ms: Self::default_bulk_read_timeout(),
            control_timeout_ms: Self::default_control_timeout(),
            interrupt_poll_ms: Self::default_interrupt_poll(),
            bulk_write_timeout_ms: Self::default_bulk_write_timeout(),
            bulk_write_queue_depth: Self::default_bulk_write_queue_depth(),
        }
    }
}

impl TransferSettings {
    fn default_bulk_read_timeout() -> u64 {
        10_000
    }

    fn default_control_timeout() -> u64 {
        5_000
    }

    fn default_interrupt_poll() -> u64 {
        100
    }

    fn default_bulk_write_timeout() -> u64 {
        5_000
    }

    fn default_bulk_write_queue_depth() -> usize {
        16
    }
}

impl Default for Osrfx2Config {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            device: DeviceSettings::default(),
            transfers: TransferSettings::default(),
        }
    }
}

impl Osrfx2Config {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/osrfx2/config.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Osrfx2Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("osrfx2").join("config.toml")
        } else {
            PathBuf::from(".config/osrfx2/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        common::validate_log_level(&self.logging.level)?;

        parse_hex_id(&self.device.vendor_id, "vendor_id")?;
        parse_hex_id(&self.device.product_id, "product_id")?;

        let t = &self.transfers;
        for (name, value) in [
            ("bulk_read_timeout_ms", t.bulk_read_timeout_ms),
            ("control_timeout_ms", t.control_timeout_ms),
            ("interrupt_poll_ms", t.interrupt_poll_ms),
            ("bulk_write_timeout_ms", t.bulk_write_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("Invalid {} '0', must be greater than 0", name));
            }
        }
        if t.bulk_write_queue_depth == 0 {
            return Err(anyhow!(
                "Invalid bulk_write_queue_depth '0', must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Id table entry for the configured device
    pub fn device_match(&self) -> Result<DeviceMatch> {
        Ok(DeviceMatch {
            vendor_id: parse_hex_id(&self.device.vendor_id, "vendor_id")?,
            product_id: parse_hex_id(&self.device.product_id, "product_id")?,
        })
    }

    pub fn transfer_config(&self) -> TransferConfig {
        let t = &self.transfers;
        TransferConfig {
            bulk_read_timeout: Duration::from_millis(t.bulk_read_timeout_ms),
            bulk_write_timeout: Duration::from_millis(t.bulk_write_timeout_ms),
            control_timeout: Duration::from_millis(t.control_timeout_ms),
            interrupt_poll: Duration::from_millis(t.interrupt_poll_ms),
            bulk_write_queue_depth: t.bulk_write_queue_depth,
        }
    }

    pub fn driver_config(&self) -> Result<DriverConfig> {
        Ok(DriverConfig {
            ids: vec![self.device_match()?],
            transfers: self.transfer_config(),
        })
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}

/// Parse a hex id such as "0x0547"
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x0547')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Osrfx2Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.device.vendor_id, "0x0547");
        assert_eq!(config.device.product_id, "0x1002");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x0547", "vendor_id").unwrap(), 0x0547);
        assert_eq!(parse_hex_id("0XABCD", "vendor_id").unwrap(), 0xABCD);
        assert!(parse_hex_id("0547", "vendor_id").is_err());
        assert!(parse_hex_id("0x", "vendor_id").is_err());
        assert!(parse_hex_id("0x12345", "vendor_id").is_err());
        assert!(parse_hex_id("0xGHIJ", "vendor_id").is_err());
    }

    #[test]
    fn test_transfer_config_matches_driver_defaults() {
        let config = Osrfx2Config::default();
        assert_eq!(config.transfer_config(), TransferConfig::default());
        assert_eq!(config.driver_config().unwrap(), DriverConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Osrfx2Config::default();
        config.transfers.interrupt_poll_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Osrfx2Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }
}
