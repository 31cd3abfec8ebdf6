//! BLE equalizer control for Fairphone Fairbuds.
//!
//! The earbuds speak a small framed protocol (`QXW`) over a vendor GATT
//! service. [`protocol`] encodes and decodes frames, [`device`] holds the EQ
//! model and the [`device::ConnectionController`] that drives a session, and
//! [`bluetooth`] provides the BlueZ transport behind the [`bluetooth::BleLink`]
//! trait.

pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;

pub use error::{Error, Result};
