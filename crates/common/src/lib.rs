//! Common utilities for osrfx2-rs
//!
//! This crate provides the error type and logging setup shared between the
//! driver core and the command-line tooling.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{VALID_LOG_LEVELS, setup_logging, validate_log_level};
