//! In-memory central used by the async tests.

use std::sync::{
   Arc,
   atomic::{AtomicBool, AtomicU32, Ordering},
};

use futures::{
   FutureExt, StreamExt,
   future::{self, BoxFuture},
   stream::{self, BoxStream},
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::{Notify, mpsc, oneshot};
use uuid::Uuid;

use crate::{
   bluetooth::backend::{Central, Discovery, GattSession, Link},
   device::DeviceIdentity,
   error::{BridgeError, Result},
   protocol::{CHARACTERISTIC_UUID, SERVICE_UUID},
};

#[derive(Default)]
pub(crate) struct MockState {
   /// Park connect attempts until `release_link`.
   pub hold_link: AtomicBool,
   /// Park service discovery until `finish_discovery`.
   pub hold_discovery: AtomicBool,
   /// Never let discovery start.
   pub hold_discover: AtomicBool,
   pub fail_connect: AtomicBool,
   pub fail_discovery: AtomicBool,
   pub fail_disconnect: AtomicBool,
   pub missing_service: AtomicBool,
   pub missing_characteristic: AtomicBool,
   pub reject_writes: AtomicBool,
   pub name: Mutex<Option<SmolStr>>,

   link_gate: Notify,
   discovery_gate: Notify,
   connects: AtomicU32,
   disconnects: AtomicU32,
   cancels: AtomicU32,
   active_scans: AtomicU32,
   writes: Mutex<Vec<Vec<u8>>>,
   drop_link: Mutex<Option<oneshot::Sender<()>>>,
   sightings: Mutex<Option<mpsc::UnboundedSender<DeviceIdentity>>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockCentral {
   state: Arc<MockState>,
}

impl MockCentral {
   pub(crate) fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub(crate) fn named(name: &str) -> Arc<Self> {
      let central = Self::default();
      *central.state.name.lock() = Some(SmolStr::new(name));
      Arc::new(central)
   }

   pub(crate) fn state(&self) -> &MockState {
      &self.state
   }

   pub(crate) fn release_link(&self) {
      self.state.link_gate.notify_one();
   }

   pub(crate) fn finish_discovery(&self) {
      self.state.discovery_gate.notify_one();
   }

   /// Drops the current link as if the peripheral went away.
   pub(crate) fn drop_link(&self) {
      if let Some(tx) = self.state.drop_link.lock().take() {
         let _ = tx.send(());
      }
   }

   /// Reports a sighting to the running discovery; false if none is running.
   pub(crate) fn sight(&self, device: DeviceIdentity) -> bool {
      self
         .state
         .sightings
         .lock()
         .as_ref()
         .is_some_and(|tx| tx.send(device).is_ok())
   }

   pub(crate) fn writes(&self) -> Vec<String> {
      self
         .state
         .writes
         .lock()
         .iter()
         .map(|w| String::from_utf8_lossy(w).into_owned())
         .collect()
   }

   pub(crate) fn connects(&self) -> u32 {
      self.state.connects.load(Ordering::SeqCst)
   }

   pub(crate) fn disconnects(&self) -> u32 {
      self.state.disconnects.load(Ordering::SeqCst)
   }

   pub(crate) fn cancels(&self) -> u32 {
      self.state.cancels.load(Ordering::SeqCst)
   }

   /// Discovery streams that have not been dropped yet.
   pub(crate) fn active_scans(&self) -> u32 {
      self.state.active_scans.load(Ordering::SeqCst)
   }
}

impl Central for MockCentral {
   type Session = MockSession;

   fn connect<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Result<Link<MockSession>>> {
      let state = self.state.clone();
      async move {
         state.connects.fetch_add(1, Ordering::SeqCst);
         if state.hold_link.load(Ordering::SeqCst) {
            state.link_gate.notified().await;
         }
         if state.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportFailure("peripheral unreachable".into()));
         }

         let (tx, rx) = oneshot::channel();
         *state.drop_link.lock() = Some(tx);
         let name = state.name.lock().clone();
         Ok(Link {
            session: MockSession { state },
            name,
            closed: async move {
               let _ = rx.await;
            }
            .boxed(),
         })
      }
      .boxed()
   }

   fn cancel<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Result<()>> {
      async move {
         self.state.cancels.fetch_add(1, Ordering::SeqCst);
         Ok(())
      }
      .boxed()
   }
}

struct ActiveScan(Arc<MockState>);

impl Drop for ActiveScan {
   fn drop(&mut self) {
      self.0.active_scans.fetch_sub(1, Ordering::SeqCst);
   }
}

impl Discovery for MockCentral {
   fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, DeviceIdentity>>> {
      let state = self.state.clone();
      async move {
         if state.hold_discover.load(Ordering::SeqCst) {
            future::pending::<()>().await;
         }
         let (tx, rx) = mpsc::unbounded_channel();
         *state.sightings.lock() = Some(tx);
         state.active_scans.fetch_add(1, Ordering::SeqCst);
         let guard = ActiveScan(state);
         let stream = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let device = rx.recv().await?;
            Some((device, (rx, guard)))
         });
         Ok(stream.boxed())
      }
      .boxed()
   }
}

pub(crate) struct MockSession {
   state: Arc<MockState>,
}

impl GattSession for MockSession {
   fn discover_services(&self) -> BoxFuture<'_, Result<()>> {
      async move {
         if self.state.hold_discovery.load(Ordering::SeqCst) {
            self.state.discovery_gate.notified().await;
         }
         if self.state.fail_discovery.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportFailure("GATT discovery failed".into()));
         }
         Ok(())
      }
      .boxed()
   }

   fn write<'a>(
      &'a self,
      service: Uuid,
      characteristic: Uuid,
      payload: &'a [u8],
   ) -> BoxFuture<'a, Result<bool>> {
      async move {
         if service != SERVICE_UUID || self.state.missing_service.load(Ordering::SeqCst) {
            return Err(BridgeError::ServiceNotFound(service));
         }
         if characteristic != CHARACTERISTIC_UUID
            || self.state.missing_characteristic.load(Ordering::SeqCst)
         {
            return Err(BridgeError::CharacteristicNotFound(characteristic));
         }
         self.state.writes.lock().push(payload.to_vec());
         Ok(!self.state.reject_writes.load(Ordering::SeqCst))
      }
      .boxed()
   }

   fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
      async move {
         self.state.disconnects.fetch_add(1, Ordering::SeqCst);
         if self.state.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportFailure("teardown rejected".into()));
         }
         Ok(())
      }
      .boxed()
   }
}
