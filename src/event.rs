//! Event handling system for bridge status updates.
//!
//! This module provides the event infrastructure for notifying about
//! link transitions, scan results and forwarded notifications.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::device::{ConnectionState, DeviceIdentity};

/// Events that can be emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
   ConnectionChanged {
      state: ConnectionState,
      device: Option<DeviceIdentity>,
   },
   DeviceFound(DeviceIdentity),
   ScanFinished {
      candidates: usize,
   },
   NotificationForwarded {
      source: SmolStr,
      delivered: bool,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BridgeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

#[cfg(test)]
pub(crate) mod testing {
   use parking_lot::Mutex;

   use super::*;

   /// Event bus recording everything emitted.
   #[derive(Default)]
   pub(crate) struct RecordingBus {
      events: Mutex<Vec<BridgeEvent>>,
   }

   impl RecordingBus {
      pub(crate) fn new() -> Arc<Self> {
         Arc::new(Self::default())
      }

      pub(crate) fn events(&self) -> Vec<BridgeEvent> {
         self.events.lock().clone()
      }

      pub(crate) fn states(&self) -> Vec<ConnectionState> {
         self
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
               BridgeEvent::ConnectionChanged { state, .. } => Some(*state),
               _ => None,
            })
            .collect()
      }
   }

   impl EventBus for RecordingBus {
      fn emit(&self, event: BridgeEvent) {
         self.events.lock().push(event);
      }
   }
}
