//! Link-layer connect permission.
//!
//! Granting is owned by the host's permission subsystem; the bridge only
//! queries it before every connect, send, disconnect and scan.

use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

pub trait LinkPermission: Send + Sync {
   fn is_granted(&self) -> bool;
}

/// Permission flag toggled at runtime by the host.
#[derive(Debug)]
pub struct PermissionGate(AtomicBool);

impl PermissionGate {
   pub const fn new(granted: bool) -> Self {
      Self(AtomicBool::new(granted))
   }

   pub fn set(&self, granted: bool) {
      if self.0.swap(granted, Ordering::Relaxed) != granted {
         info!("Bluetooth connect permission {}", if granted { "granted" } else { "revoked" });
      }
   }
}

impl LinkPermission for PermissionGate {
   fn is_granted(&self) -> bool {
      self.0.load(Ordering::Relaxed)
   }
}
