//! Bluetooth Low Energy layer.
//!
//! This module provides the central-role capability traits, the single-owner
//! link to the peripheral and bounded device discovery.

pub mod backend;
#[cfg(feature = "bluez")]
pub mod bluez;
#[cfg(test)]
pub(crate) mod mock;
pub mod permission;
pub mod policy;
pub mod scanner;
pub mod transport;
