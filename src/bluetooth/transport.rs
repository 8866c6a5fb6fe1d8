//! Single-owner BLE link to the peripheral.
//!
//! `BleTransport` is a cloneable handle; all session state lives in
//! `TransportActor`, which serializes caller commands with the loopback
//! events raised by its connect, discovery and link-monitor tasks. Those
//! tasks are tagged with the generation of the attempt that spawned them and
//! their events are dropped once that attempt has been superseded.

use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   bluetooth::{
      backend::{Central, GattSession, Link},
      permission::LinkPermission,
      policy::{DisconnectReason, LinkPolicy},
   },
   device::{ConnectionState, DeviceIdentity},
   error::{BridgeError, Result},
   event::{BridgeEvent, EventSender},
   protocol::{CHARACTERISTIC_UUID, SERVICE_UUID},
   store::{ConnectionStateStore, KnownDevices, PersistedConnectionRecord, Store},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Maximum time to wait for a requested teardown
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot published on every link transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
   pub state: ConnectionState,
   pub device: Option<DeviceIdentity>,
   /// Connect attempt this status belongs to.
   pub generation: u64,
}

/// In-memory link state plus the persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
   pub link: LinkStatus,
   pub record: PersistedConnectionRecord,
}

impl TransportStatus {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "state": self.link.state.to_str(),
          "device": self.link.device.as_ref().map(DeviceIdentity::to_json),
          "persisted": {
              "device": self.record.device.as_ref().map(DeviceIdentity::to_json),
              "is_connected": self.record.is_connected,
          },
      })
   }
}

// === Commands ===

enum Command {
   Connect(SmolStr, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<Result<bool>>),
   Send(Vec<u8>, oneshot::Sender<Result<bool>>),
   Shutdown(oneshot::Sender<()>),
}

enum LinkEvent<S> {
   Established { generation: u64, link: Link<S> },
   ConnectFailed { generation: u64, error: SmolStr },
   ServicesResolved { generation: u64 },
   DiscoveryFailed { generation: u64, error: SmolStr },
   Lost { generation: u64 },
   Reconnect { address: SmolStr },
}

// === Handle ===

/// Handle to the transport task.
#[derive(Clone)]
pub struct BleTransport {
   inbox: mpsc::Sender<Command>,
   status: watch::Receiver<LinkStatus>,
   record: ConnectionStateStore,
}

impl BleTransport {
   /// Spawns the transport task on the current runtime.
   pub fn spawn<B: Central>(
      backend: Arc<B>,
      store: &Store,
      permission: Arc<dyn LinkPermission>,
      policy: Arc<dyn LinkPolicy>,
      event_tx: EventSender,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (status_tx, status_rx) = watch::channel(LinkStatus::default());
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      let actor = TransportActor {
         backend,
         permission,
         policy,
         record: store.connection(),
         known: store.known_devices(),
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         status_tx,
         generation: 0,
         attempt: None,
         reconnect_attempts: 0,
         reconnect_timer: None,
      };
      tokio::spawn(actor.run());

      Self {
         inbox: command_tx,
         status: status_rx,
         record: store.connection(),
      }
   }

   async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)?;
      rx.await.map_err(|_| BridgeError::ManagerShutdown)
   }

   /// Starts connecting to `address`; completion is reported as a state change.
   pub async fn connect(&self, address: &str) -> Result<()> {
      self
         .request(|tx| Command::Connect(SmolStr::new(address), tx))
         .await?
   }

   /// Tears down the link; `false` if there was none.
   pub async fn disconnect(&self) -> Result<bool> {
      self.request(Command::Disconnect).await?
   }

   /// Writes `payload` to the bridge characteristic.
   pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<bool> {
      let payload = payload.into();
      self.request(|tx| Command::Send(payload, tx)).await?
   }

   /// Closes the link, keeping the peripheral's identity on record.
   pub async fn shutdown(&self) {
      let _ = self.request(Command::Shutdown).await;
   }

   pub fn state(&self) -> ConnectionState {
      self.status.borrow().state
   }

   pub fn link(&self) -> LinkStatus {
      self.status.borrow().clone()
   }

   pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
      self.status.clone()
   }

   pub fn status(&self) -> Result<TransportStatus> {
      Ok(TransportStatus {
         link: self.link(),
         record: self.record.load()?,
      })
   }
}

// === Transport Actor ===

struct Attempt<S> {
   generation: u64,
   address: SmolStr,
   device: Option<DeviceIdentity>,
   session: Option<Arc<S>>,
   tasks: JoinSet<()>,
}

struct TransportActor<B: Central> {
   backend: Arc<B>,
   permission: Arc<dyn LinkPermission>,
   policy: Arc<dyn LinkPolicy>,
   record: ConnectionStateStore,
   known: KnownDevices,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::Receiver<LinkEvent<B::Session>>,
   loopback_tx: mpsc::Sender<LinkEvent<B::Session>>,
   status_tx: watch::Sender<LinkStatus>,

   // State
   generation: u64,
   attempt: Option<Attempt<B::Session>>,
   reconnect_attempts: u32,
   reconnect_timer: Option<JoinHandle<()>>,
}

impl<B: Central> TransportActor<B> {
   async fn run(mut self) {
      info!("BLE transport starting up");
      self.recover_stale_record();

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("BLE transport shutting down");
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             Some(event) = self.loopback_rx.recv() => {
                 self.handle_link_event(event);
             }
         }
      }

      self.cleanup().await;
   }

   /// A record still flagged connected means the last run never tore down.
   fn recover_stale_record(&self) {
      match self.record.load() {
         Ok(record) if record.is_connected => {
            if let Some(device) = &record.device {
               warn!("Previous session with {device} was not closed, marking it disconnected");
            }
            if let Err(e) = self.record.mark_disconnected() {
               error!("Failed to update connection record: {e}");
            }
         },
         Ok(_) => {},
         Err(e) => error!("Failed to read connection record: {e}"),
      }
   }

   async fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::Connect(address, reply) => {
            let _ = reply.send(self.connect(address));
         },
         Command::Disconnect(reply) => {
            let _ = reply.send(self.disconnect().await);
         },
         Command::Send(payload, reply) => {
            let _ = reply.send(self.send(payload).await);
         },
         Command::Shutdown(reply) => {
            self.cleanup().await;
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   fn handle_link_event(&mut self, event: LinkEvent<B::Session>) {
      match event {
         LinkEvent::Established { generation, link } => {
            self.handle_established(generation, link);
         },
         LinkEvent::ConnectFailed { generation, error } => {
            if self.is_current(generation) {
               self.handle_link_down(DisconnectReason::ConnectFailed(error));
            }
         },
         LinkEvent::ServicesResolved { generation } => {
            self.handle_services_resolved(generation);
         },
         LinkEvent::DiscoveryFailed { generation, error } => {
            if self.is_current(generation) {
               self.handle_link_down(DisconnectReason::DiscoveryFailed(error));
            }
         },
         LinkEvent::Lost { generation } => {
            if self.is_current(generation) {
               self.handle_link_down(DisconnectReason::LinkLost);
            }
         },
         LinkEvent::Reconnect { address } => {
            self.handle_reconnect(address);
         },
      }
   }

   fn state(&self) -> ConnectionState {
      self.status_tx.borrow().state
   }

   fn is_current(&self, generation: u64) -> bool {
      let current = self
         .attempt
         .as_ref()
         .is_some_and(|a| a.generation == generation);
      if !current {
         debug!("Ignoring event from superseded attempt {generation}");
      }
      current
   }

   fn publish(&mut self, state: ConnectionState, device: Option<DeviceIdentity>) {
      let status = LinkStatus {
         state,
         device: device.clone(),
         generation: self.generation,
      };
      if *self.status_tx.borrow() == status {
         return;
      }
      debug!("Link state: {state}");
      self.status_tx.send_replace(status);
      self
         .event_tx
         .emit(BridgeEvent::ConnectionChanged { state, device });
   }

   // === Caller Commands ===

   fn connect(&mut self, address: SmolStr) -> Result<()> {
      if !self.permission.is_granted() {
         warn!("Refusing to connect to {address}: permission not granted");
         return Err(BridgeError::PermissionDenied);
      }

      self.cancel_reconnect();
      if let Some(previous) = self.attempt.take() {
         info!("Superseding link to {}", previous.address);
         if previous.session.is_none() {
            let backend = self.backend.clone();
            let address = previous.address.clone();
            tokio::spawn(async move {
               if let Err(e) = cancel_connect(&*backend, &address).await {
                  debug!("Cancelling connect to {address}: {e}");
               }
            });
         }
         self.release(previous);
      }
      self.start_attempt(address);
      Ok(())
   }

   async fn disconnect(&mut self) -> Result<bool> {
      if self.attempt.is_none() {
         debug!("Disconnect requested without a live session");
         self.cancel_reconnect();
         return Ok(false);
      }
      if !self.permission.is_granted() {
         warn!("Refusing to disconnect: permission not granted");
         return Err(BridgeError::PermissionDenied);
      }

      self.cancel_reconnect();
      let Some(attempt) = self.attempt.take() else {
         return Ok(false);
      };
      let address = attempt.address.clone();
      let session = attempt.session.clone();
      drop(attempt);

      let teardown = match session {
         Some(session) => teardown(&*session).await,
         None => cancel_connect(&*self.backend, &address).await,
      };
      self.clear_record();
      self.publish(ConnectionState::Disconnected, None);
      info!("Disconnected from {address}");

      teardown.map(|()| true).map_err(|e| {
         warn!("Teardown of link to {address} failed: {e}");
         BridgeError::TransportFailure(e.to_string())
      })
   }

   async fn send(&mut self, payload: Vec<u8>) -> Result<bool> {
      if self.state() != ConnectionState::Ready || !self.permission.is_granted() {
         debug!("Dropping {} byte write, link not ready", payload.len());
         return Err(BridgeError::NoActiveConnection);
      }
      let Some((address, session)) = self
         .attempt
         .as_ref()
         .and_then(|a| Some((a.address.clone(), a.session.clone()?)))
      else {
         return Err(BridgeError::NoActiveConnection);
      };

      debug!("→ {address}: {}", hex::encode(&payload));
      match session
         .write(SERVICE_UUID, CHARACTERISTIC_UUID, &payload)
         .await
      {
         Ok(true) => Ok(true),
         Ok(false) => {
            warn!("Write to {address} was not accepted");
            Ok(false)
         },
         Err(e @ (BridgeError::ServiceNotFound(_) | BridgeError::CharacteristicNotFound(_))) => {
            error!("Write to {address} failed: {e}");
            Err(e)
         },
         Err(e) => {
            warn!("Write to {address} failed: {e}");
            Ok(false)
         },
      }
   }

   async fn cleanup(&mut self) {
      self.cancel_reconnect();
      let Some(attempt) = self.attempt.take() else {
         return;
      };

      info!("Closing link to {}", attempt.address);
      let result = match attempt.session.clone() {
         Some(session) => teardown(&*session).await,
         None => cancel_connect(&*self.backend, &attempt.address).await,
      };
      if let Err(e) = result {
         warn!("Teardown of link to {} failed: {e}", attempt.address);
      }
      drop(attempt);

      if let Err(e) = self.record.mark_disconnected() {
         error!("Failed to update connection record: {e}");
      }
      self.publish(ConnectionState::Disconnected, None);
   }

   // === Link Lifecycle ===

   fn start_attempt(&mut self, address: SmolStr) {
      self.generation += 1;
      let generation = self.generation;

      let mut tasks = JoinSet::new();
      let backend = self.backend.clone();
      let loopback = self.loopback_tx.clone();
      let timeout = self.policy.connect_timeout();
      let target = address.clone();
      tasks.spawn(async move {
         let attempt = backend.connect(&target);
         let result = match timeout {
            Some(limit) => time::timeout(limit, attempt)
               .await
               .unwrap_or(Err(BridgeError::RequestTimeout)),
            None => attempt.await,
         };
         let event = match result {
            Ok(link) => LinkEvent::Established { generation, link },
            Err(e) => LinkEvent::ConnectFailed {
               generation,
               error: e.to_string().into(),
            },
         };
         let _ = loopback.send(event).await;
      });

      info!("Connecting to {address}");
      self.attempt = Some(Attempt {
         generation,
         address,
         device: None,
         session: None,
         tasks,
      });
      self.publish(ConnectionState::Connecting, None);
   }

   fn handle_established(&mut self, generation: u64, link: Link<B::Session>) {
      let Link {
         session,
         name,
         closed,
      } = link;

      let Some(attempt) = self
         .attempt
         .as_mut()
         .filter(|a| a.generation == generation)
      else {
         debug!("Releasing link from superseded attempt {generation}");
         tokio::spawn(async move {
            let _ = teardown(&session).await;
         });
         return;
      };

      let device = DeviceIdentity::new(attempt.address.clone(), name);
      let session = Arc::new(session);

      let loopback = self.loopback_tx.clone();
      attempt.tasks.spawn(async move {
         closed.await;
         let _ = loopback.send(LinkEvent::Lost { generation }).await;
      });

      let loopback = self.loopback_tx.clone();
      let discovering = session.clone();
      attempt.tasks.spawn(async move {
         let event = match discovering.discover_services().await {
            Ok(()) => LinkEvent::ServicesResolved { generation },
            Err(e) => LinkEvent::DiscoveryFailed {
               generation,
               error: e.to_string().into(),
            },
         };
         let _ = loopback.send(event).await;
      });

      attempt.session = Some(session);
      attempt.device = Some(device.clone());

      info!("Link established with {device}");
      if let Err(e) = self.record.save(&device) {
         error!("Failed to persist connection record: {e}");
      }
      if let Err(e) = self.known.add(&device) {
         warn!("Failed to remember {device}: {e}");
      }
      self.publish(ConnectionState::ServiceDiscovery, Some(device));
   }

   fn handle_services_resolved(&mut self, generation: u64) {
      if !self.is_current(generation) || self.state() != ConnectionState::ServiceDiscovery {
         return;
      }
      let device = self.attempt.as_ref().and_then(|a| a.device.clone());
      if let Some(device) = &device {
         info!("Services resolved on {device}, link ready");
      }
      self.reconnect_attempts = 0;
      self.publish(ConnectionState::Ready, device);
   }

   fn handle_link_down(&mut self, reason: DisconnectReason) {
      let Some(attempt) = self.attempt.take() else {
         return;
      };
      let address = attempt.address.clone();
      warn!("Link to {address} down: {reason}");
      self.release(attempt);
      self.schedule_reconnect(address);
   }

   /// Drops `attempt` and its tasks, then returns to `Disconnected`.
   fn release(&mut self, attempt: Attempt<B::Session>) {
      if let Some(session) = attempt.session.clone() {
         let address = attempt.address.clone();
         tokio::spawn(async move {
            if let Err(e) = teardown(&*session).await {
               debug!("Teardown of released link to {address}: {e}");
            }
         });
      }
      drop(attempt);
      self.clear_record();
      self.publish(ConnectionState::Disconnected, None);
   }

   fn clear_record(&self) {
      if let Err(e) = self.record.clear() {
         error!("Failed to clear connection record: {e}");
      }
   }

   // === Reconnect Policy ===

   fn schedule_reconnect(&mut self, address: SmolStr) {
      let attempt = self.reconnect_attempts + 1;
      let Some(delay) = self.policy.reconnect_delay(attempt) else {
         if self.reconnect_attempts > 0 {
            info!(
               "Giving up on {address} after {} reconnect attempts",
               self.reconnect_attempts
            );
         }
         self.reconnect_attempts = 0;
         return;
      };

      self.reconnect_attempts = attempt;
      info!("Reconnecting to {address} in {delay:?} (attempt {attempt})");
      let loopback = self.loopback_tx.clone();
      self.reconnect_timer = Some(tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(LinkEvent::Reconnect { address }).await;
      }));
   }

   fn handle_reconnect(&mut self, address: SmolStr) {
      self.reconnect_timer = None;
      if self.attempt.is_some() {
         return;
      }
      if !self.permission.is_granted() {
         warn!("Skipping reconnect to {address}: permission not granted");
         self.reconnect_attempts = 0;
         return;
      }
      self.start_attempt(address);
   }

   fn cancel_reconnect(&mut self) {
      if let Some(timer) = self.reconnect_timer.take() {
         timer.abort();
      }
      self.reconnect_attempts = 0;
   }
}

async fn teardown<S: GattSession>(session: &S) -> Result<()> {
   time::timeout(TEARDOWN_TIMEOUT, session.disconnect())
      .await
      .unwrap_or(Err(BridgeError::RequestTimeout))
}

async fn cancel_connect<B: Central>(backend: &B, address: &str) -> Result<()> {
   time::timeout(TEARDOWN_TIMEOUT, backend.cancel(address))
      .await
      .unwrap_or(Err(BridgeError::RequestTimeout))
}
