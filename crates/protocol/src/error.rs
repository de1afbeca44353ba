//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Byte is not one of the vendor request codes the board understands
    #[error("Unknown vendor request: {0:#04x}")]
    UnknownRequest(u8),

    /// Attribute name is not exposed by the driver
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
