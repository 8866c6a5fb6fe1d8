//! Bridge between host notifications and a BLE peripheral.
//!
//! Captured notifications from opted-in sources are framed as pipe-delimited
//! text and written to a single GATT characteristic on a paired peripheral.
//! The daemon binary exposes the bridge over D-Bus.

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod dbus;
pub mod device;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod protocol;
pub mod store;
