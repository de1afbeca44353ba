//! Named device attributes
//!
//! The three text attributes published for each device (`switches`,
//! `bargraph`, `7segment`), as typed show/store operations. Shown values
//! are eight '0'/'1' characters with the highest-order bit leftmost, or the
//! suspended sentinel for the outputs. Stored values are decimal.

use crate::context::DeviceContext;
use crate::error::{DriverError, Result};
use protocol::{ProtocolError, parse_decimal};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Switches,
    Bargraph,
    SevenSegment,
}

impl Attribute {
    pub const ALL: [Attribute; 3] = [
        Attribute::Switches,
        Attribute::Bargraph,
        Attribute::SevenSegment,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Attribute::Switches => "switches",
            Attribute::Bargraph => "bargraph",
            Attribute::SevenSegment => "7segment",
        }
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, Attribute::Switches)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Attribute {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Attribute::ALL
            .into_iter()
            .find(|attr| attr.name() == s)
            .ok_or_else(|| ProtocolError::UnknownAttribute(s.to_string()))
    }
}

/// Attribute surface of one device
#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    ctx: Arc<DeviceContext>,
}

impl DeviceAttributes {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    pub fn show(&self, attr: Attribute) -> Result<String> {
        self.ctx.ensure_attached()?;
        let vendor = self.ctx.vendor();

        let text = match attr {
            Attribute::Switches => vendor.read_switches().to_string(),
            Attribute::Bargraph => vendor.read_leds()?.to_string(),
            Attribute::SevenSegment => vendor.read_segments()?.to_string(),
        };
        Ok(text)
    }

    /// Store a decimal value; returns the number of input bytes consumed
    ///
    /// Input is parsed leniently: text without leading digits counts as 0,
    /// and values outside 0..=255 switch the output off.
    pub fn store(&self, attr: Attribute, input: &str) -> Result<usize> {
        self.ctx.ensure_attached()?;

        let value = parse_decimal(input);
        let vendor = self.ctx.vendor();
        match attr {
            Attribute::Switches => return Err(DriverError::ReadOnlyAttribute(attr.name())),
            Attribute::Bargraph => vendor.write_leds(value)?,
            Attribute::SevenSegment => vendor.write_segments(value)?,
        }

        Ok(input.len())
    }

    /// Show by attribute name
    pub fn show_named(&self, name: &str) -> Result<String> {
        self.show(name.parse()?)
    }

    /// Store by attribute name
    pub fn store_named(&self, name: &str, input: &str) -> Result<usize> {
        self.store(name.parse()?, input)
    }
}
