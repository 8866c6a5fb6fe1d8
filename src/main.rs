//! beeperd D-Bus service
//!
//! This service forwards desktop notifications from opted-in sources to a
//! BLE peripheral and exposes pairing, scanning and source selection over
//! D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use beeperd::{
   bluetooth::{bluez::BluezCentral, permission::PermissionGate},
   bridge::Bridge,
   config::Config,
   dbus::{BUS_NAME, BridgeService, OBJECT_PATH},
   error::Result,
   event::{BridgeEvent, EventBus},
   store::Store,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting beeperd...");

   let config = Config::load()?;
   let store = Store::open_default()?;

   // Create event channel
   let event_bus = EventProcessor::new();

   let permission = Arc::new(PermissionGate::new(config.link_permission));
   let central = Arc::new(BluezCentral::new(config.adapter.as_deref()).await?);
   let bridge = Arc::new(Bridge::new(
      central,
      &store,
      permission,
      config.link_policy(),
      event_bus.clone(),
      config.time_sync_delay(),
   ));

   if config.auto_connect_last
      && let Err(e) = bridge.connect_last().await
   {
      warn!("Failed to reconnect last peripheral: {e}");
   }

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, BridgeService::new(bridge.clone()))?
      .build()
      .await?;

   info!("beeperd D-Bus service started at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down beeperd...");
   bridge.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<BridgeEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<BridgeEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<BridgeService>, event: BridgeEvent) -> Result<()> {
      let emitter = iface.signal_emitter();
      match event {
         BridgeEvent::ConnectionChanged { state, device } => {
            let address = device.as_ref().map_or("", |d| d.address.as_str());
            BridgeService::connection_changed(emitter, state.to_str(), address).await?;
            iface.get().await.state_changed(emitter).await?;
         },
         BridgeEvent::DeviceFound(device) => {
            BridgeService::device_found(emitter, &device.address, &device.name).await?;
         },
         BridgeEvent::ScanFinished { candidates } => {
            let count = u32::try_from(candidates).unwrap_or(u32::MAX);
            BridgeService::scan_finished(emitter, count).await?;
         },
         BridgeEvent::NotificationForwarded { source, delivered } => {
            BridgeService::notification_forwarded(emitter, &source, delivered).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BridgeService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: BridgeEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
