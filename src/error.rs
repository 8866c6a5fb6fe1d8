//! Error types for the bridge service.
//!
//! This module defines all error types that can occur while driving the
//! peripheral link, including Bluetooth, D-Bus, I/O, persistence and
//! protocol errors.

use thiserror::Error;
use uuid::Uuid;

use crate::store;

/// Main error type for the bridge service.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Store error: {0}")]
   Store(#[from] store::Error),

   #[error("Bluetooth connect permission not granted")]
   PermissionDenied,

   #[error("No active connection")]
   NoActiveConnection,

   #[error("Service {0} not found on peripheral")]
   ServiceNotFound(Uuid),

   #[error("Characteristic {0} not found on peripheral")]
   CharacteristicNotFound(Uuid),

   #[error("Transport failure: {0}")]
   TransportFailure(String),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Invalid message: {0}")]
   InvalidMessage(String),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Transport has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
