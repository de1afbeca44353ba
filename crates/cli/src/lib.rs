//! Command-line tooling for the OSR USB-FX2 driver core
//!
//! The `osrfx2-ctl` binary drives the board through [`driver::Driver`];
//! this library holds the configuration layer it shares with tests.

pub mod config;

pub use config::Osrfx2Config;
