//! Bounded discovery of nearby peripherals.
//!
//! A scan collects sightings for at most `SCAN_TIMEOUT`. The cutoff is
//! enforced twice: a timer drops the platform stream, and every admission is
//! checked against the deadline so late reports never land in the list.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   select,
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   bluetooth::{backend::Discovery, permission::LinkPermission},
   device::DeviceIdentity,
   error::{BridgeError, Result},
   event::{BridgeEvent, EventSender},
};

/// Hard bound on a single scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidates of the current scan, in discovery order.
#[derive(Debug, Default)]
struct CandidateList {
   generation: u64,
   deadline: Option<Instant>,
   devices: Vec<DeviceIdentity>,
}

impl CandidateList {
   /// Clears prior results and opens a new scan window at `now`.
   fn reset(&mut self, now: Instant) -> u64 {
      self.generation += 1;
      self.deadline = Some(now + SCAN_TIMEOUT);
      self.devices.clear();
      self.generation
   }

   /// Admits `device` if the window of `generation` is still open at `now`
   /// and its address is new.
   fn offer(&mut self, generation: u64, device: DeviceIdentity, now: Instant) -> bool {
      if generation != self.generation {
         return false;
      }
      match self.deadline {
         Some(deadline) if now < deadline => {},
         _ => return false,
      }
      if self.devices.iter().any(|d| d.address == device.address) {
         return false;
      }
      self.devices.push(device);
      true
   }

   /// Closes the window of `generation`; false if it was not open.
   fn close(&mut self, generation: u64) -> bool {
      if generation != self.generation || self.deadline.is_none() {
         return false;
      }
      self.deadline = None;
      true
   }
}

pub struct ScanCoordinator {
   source: Arc<dyn Discovery>,
   permission: Arc<dyn LinkPermission>,
   event_tx: EventSender,
   list: Arc<Mutex<CandidateList>>,
   task: Mutex<Option<JoinHandle<()>>>,
}

impl ScanCoordinator {
   pub fn new(
      source: Arc<dyn Discovery>,
      permission: Arc<dyn LinkPermission>,
      event_tx: EventSender,
   ) -> Self {
      Self {
         source,
         permission,
         event_tx,
         list: Arc::default(),
         task: Mutex::new(None),
      }
   }

   /// Starts a fresh scan, replacing any running one.
   pub fn start_scan(&self) -> Result<()> {
      if !self.permission.is_granted() {
         warn!("Refusing to scan: permission not granted");
         return Err(BridgeError::PermissionDenied);
      }

      // Held until the new handle is stored so concurrent starts cannot orphan a scan.
      let mut task = self.task.lock();
      self.stop_locked(&mut task);
      let now = Instant::now();
      let deadline = now + SCAN_TIMEOUT;
      let generation = self.list.lock().reset(now);
      info!("Scanning for peripherals");

      let source = self.source.clone();
      let list = self.list.clone();
      let event_tx = self.event_tx.clone();
      *task = Some(tokio::spawn(async move {
         match time::timeout_at(deadline, source.discover()).await {
            Ok(Ok(mut sightings)) => {
               let cutoff = time::sleep_until(deadline);
               tokio::pin!(cutoff);
               loop {
                  select! {
                      () = &mut cutoff => break,
                      sighting = sightings.next() => {
                          let Some(device) = sighting else {
                              debug!("Discovery stream ended early");
                              break;
                          };
                          if list.lock().offer(generation, device.clone(), Instant::now()) {
                              debug!("Found {device}");
                              event_tx.emit(BridgeEvent::DeviceFound(device));
                          }
                      }
                  }
               }
            },
            Ok(Err(e)) => warn!("Failed to start discovery: {e}"),
            Err(_) => warn!("Discovery did not start within {SCAN_TIMEOUT:?}"),
         }

         let mut list = list.lock();
         if list.close(generation) {
            let candidates = list.devices.len();
            drop(list);
            info!("Scan finished with {candidates} candidates");
            event_tx.emit(BridgeEvent::ScanFinished { candidates });
         }
      }));
      Ok(())
   }

   /// Stops the running scan, if any; returns whether one was running.
   pub fn stop_scan(&self) -> bool {
      let mut task = self.task.lock();
      self.stop_locked(&mut task)
   }

   fn stop_locked(&self, task: &mut Option<JoinHandle<()>>) -> bool {
      if let Some(handle) = task.take() {
         handle.abort();
      }

      let mut list = self.list.lock();
      let generation = list.generation;
      if !list.close(generation) {
         return false;
      }
      let candidates = list.devices.len();
      drop(list);
      info!("Scan stopped with {candidates} candidates");
      self
         .event_tx
         .emit(BridgeEvent::ScanFinished { candidates });
      true
   }

   pub fn is_scanning(&self) -> bool {
      self.list.lock().deadline.is_some()
   }

   /// Candidates in discovery order.
   pub fn candidates(&self) -> Vec<DeviceIdentity> {
      self.list.lock().devices.clone()
   }
}

impl Drop for ScanCoordinator {
   fn drop(&mut self) {
      if let Some(handle) = self.task.lock().take() {
         handle.abort();
      }
   }
}
