//! Daemon facade over the link, the scanner, the pipeline and the stores.

use std::{sync::Arc, time::Duration};

use chrono::Local;
use log::{debug, info, warn};
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle, time};

use crate::{
   bluetooth::{
      backend::{Central, Discovery},
      permission::{LinkPermission, PermissionGate},
      policy::LinkPolicy,
      scanner::ScanCoordinator,
      transport::{BleTransport, LinkStatus},
   },
   device::{ConnectionState, DeviceIdentity},
   error::{BridgeError, Result},
   event::EventSender,
   pipeline::{NotificationPipeline, Outcome},
   protocol::{NotificationEvent, WireMessage, normalize_ssid},
   store::{KnownDevices, SelectedSourceRegistry, Store},
};

pub struct Bridge {
   transport: BleTransport,
   scanner: ScanCoordinator,
   pipeline: NotificationPipeline,
   sources: SelectedSourceRegistry,
   known: KnownDevices,
   permission: Arc<PermissionGate>,
   time_sync: JoinHandle<()>,
}

impl Bridge {
   pub fn new<B: Central + Discovery>(
      backend: Arc<B>,
      store: &Store,
      permission: Arc<PermissionGate>,
      policy: Arc<dyn LinkPolicy>,
      event_tx: EventSender,
      time_sync_delay: Duration,
   ) -> Self {
      let transport = BleTransport::spawn(
         backend.clone(),
         store,
         permission.clone(),
         policy,
         event_tx.clone(),
      );
      let scanner = ScanCoordinator::new(backend, permission.clone(), event_tx.clone());
      let pipeline = NotificationPipeline::new(store.sources(), transport.clone(), event_tx);
      let time_sync = spawn_time_sync(transport.clone(), time_sync_delay);

      Self {
         transport,
         scanner,
         pipeline,
         sources: store.sources(),
         known: store.known_devices(),
         permission,
         time_sync,
      }
   }

   // === Link ===

   /// Connects to `target`, either a bare address or a `"name (address)"` label.
   pub async fn connect(&self, target: &str) -> Result<()> {
      let address = DeviceIdentity::address_from_label(target).unwrap_or(target);
      if address.is_empty() {
         return Err(BridgeError::InvalidAddress(target.to_string()));
      }
      self.scanner.stop_scan();
      self.transport.connect(address).await
   }

   /// Reconnects the peripheral on record; `false` if there is none.
   pub async fn connect_last(&self) -> Result<bool> {
      let Some(device) = self.transport.status()?.record.device else {
         debug!("No peripheral on record");
         return Ok(false);
      };
      info!("Reconnecting to last peripheral {device}");
      self.transport.connect(&device.address).await?;
      Ok(true)
   }

   pub async fn disconnect(&self) -> Result<bool> {
      self.transport.disconnect().await
   }

   pub fn state(&self) -> ConnectionState {
      self.transport.state()
   }

   pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
      self.transport.subscribe()
   }

   pub fn status(&self) -> Result<serde_json::Value> {
      let mut status = self.transport.status()?.to_json();
      status["scanning"] = json!(self.scanner.is_scanning());
      status["link_permission"] = json!(self.permission.is_granted());
      Ok(status)
   }

   // === Messages ===

   pub async fn send_raw(&self, data: &str) -> Result<bool> {
      self.transport.send(data.as_bytes()).await
   }

   pub async fn sync_time(&self) -> Result<bool> {
      send_time(&self.transport).await
   }

   pub async fn send_wifi_credentials(&self, ssid: &str, password: &str) -> Result<bool> {
      let ssid = normalize_ssid(ssid)
         .ok_or_else(|| BridgeError::InvalidMessage(format!("no usable SSID in {ssid:?}")))?;
      let message = WireMessage::wifi_credentials(&ssid, password);
      if message.has_framing_hazard() {
         warn!("Wi-Fi credentials contain the field delimiter, peripheral may misparse them");
      }
      self.transport.send(message.to_bytes()).await
   }

   pub async fn post_notification(&self, event: &NotificationEvent) -> Result<Outcome> {
      self.pipeline.handle(event).await
   }

   // === Scanning ===

   pub fn start_scan(&self) -> Result<()> {
      self.scanner.start_scan()
   }

   pub fn stop_scan(&self) -> bool {
      self.scanner.stop_scan()
   }

   pub fn candidates(&self) -> Vec<DeviceIdentity> {
      self.scanner.candidates()
   }

   // === Sources ===

   pub fn set_source_selected(&self, source: &str, selected: bool) -> Result<()> {
      self.sources.set(source, selected)
   }

   pub fn is_source_selected(&self, source: &str) -> Result<bool> {
      self.sources.get(source)
   }

   pub fn sources(&self) -> &SelectedSourceRegistry {
      &self.sources
   }

   // === Known devices ===

   pub fn known_devices(&self) -> Result<Vec<DeviceIdentity>> {
      self.known.list()
   }

   pub fn forget_device(&self, address: &str) -> Result<bool> {
      self.known.remove(address)
   }

   // === Permission ===

   pub fn set_link_permission(&self, granted: bool) {
      self.permission.set(granted);
   }

   pub async fn shutdown(&self) {
      self.scanner.stop_scan();
      self.time_sync.abort();
      self.transport.shutdown().await;
   }
}

impl Drop for Bridge {
   fn drop(&mut self) {
      self.time_sync.abort();
   }
}

async fn send_time(transport: &BleTransport) -> Result<bool> {
   let message = WireMessage::time_sync(&Local::now());
   transport.send(message.to_bytes()).await
}

/// Sends the clock once per connection, `delay` after it becomes ready.
fn spawn_time_sync(transport: BleTransport, delay: Duration) -> JoinHandle<()> {
   let mut rx = transport.subscribe();
   tokio::spawn(async move {
      let mut synced = None;
      while rx.changed().await.is_ok() {
         let LinkStatus {
            state, generation, ..
         } = *rx.borrow_and_update();
         if state != ConnectionState::Ready || synced == Some(generation) {
            continue;
         }
         synced = Some(generation);

         time::sleep(delay).await;
         let link = transport.link();
         if link.state != ConnectionState::Ready || link.generation != generation {
            debug!("Link left ready state before time sync");
            continue;
         }
         match send_time(&transport).await {
            Ok(true) => info!("Synchronized peripheral clock"),
            Ok(false) => warn!("Peripheral did not accept time sync"),
            Err(e) => warn!("Failed to synchronize peripheral clock: {e}"),
         }
      }
   })
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::{mock::MockCentral, policy::Manual},
      event::testing::RecordingBus,
      protocol::MessageKind,
      store::tests::create_test_store,
   };

   const ADDRESS: &str = "24:6F:28:AA:01:02";
   const WAIT: Duration = Duration::from_secs(10);

   fn bridge(central: Arc<MockCentral>, store: &Store) -> Bridge {
      Bridge::new(
         central,
         store,
         Arc::new(PermissionGate::new(true)),
         Arc::new(Manual),
         RecordingBus::new(),
         Duration::from_millis(1000),
      )
   }

   async fn wait_until(bridge: &Bridge, mut pred: impl FnMut(&LinkStatus) -> bool) {
      let mut rx = bridge.subscribe();
      time::timeout(WAIT, rx.wait_for(|s| pred(s)))
         .await
         .expect("timed out waiting for link status")
         .map(|_| ())
         .expect("transport stopped");
   }

   fn time_writes(central: &MockCentral) -> usize {
      central
         .writes()
         .iter()
         .filter_map(|w| w.parse::<WireMessage>().ok())
         .filter(|m| m.kind() == MessageKind::TimeSync)
         .count()
   }

   #[tokio::test(start_paused = true)]
   async fn test_time_synced_once_after_ready() {
      let (store, _dir) = create_test_store();
      let central = MockCentral::named("ESP32");
      let bridge = bridge(central.clone(), &store);

      bridge.connect(ADDRESS).await.unwrap();
      wait_until(&bridge, |s| s.state == ConnectionState::Ready).await;
      assert_eq!(time_writes(&central), 0);

      time::sleep(Duration::from_millis(1100)).await;
      assert_eq!(time_writes(&central), 1);
      time::sleep(Duration::from_secs(5)).await;
      assert_eq!(time_writes(&central), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_time_sync_skipped_when_link_drops() {
      let (store, _dir) = create_test_store();
      let central = MockCentral::named("ESP32");
      let bridge = bridge(central.clone(), &store);

      bridge.connect(ADDRESS).await.unwrap();
      wait_until(&bridge, |s| s.state == ConnectionState::Ready).await;
      assert!(bridge.disconnect().await.unwrap());

      time::sleep(Duration::from_secs(2)).await;
      assert!(central.writes().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_each_connection_is_synced() {
      let (store, _dir) = create_test_store();
      let central = MockCentral::named("ESP32");
      let bridge = bridge(central.clone(), &store);

      for generation in 1..=2 {
         bridge.connect(ADDRESS).await.unwrap();
         wait_until(&bridge, |s| {
            s.generation == generation && s.state == ConnectionState::Ready
         })
         .await;
         time::sleep(Duration::from_millis(1100)).await;
      }
      assert_eq!(time_writes(&central), 2);
   }

   #[tokio::test]
   async fn test_connect_accepts_list_label() {
      let (store, _dir) = create_test_store();
      let central = MockCentral::named("ESP32");
      let bridge = bridge(central, &store);

      bridge.connect("ESP32 (24:6F:28:AA:01:02)").await.unwrap();
      wait_until(&bridge, |s| s.state == ConnectionState::Ready).await;
      let device = bridge.subscribe().borrow().device.clone().unwrap();
      assert_eq!(device.address, ADDRESS);
      assert_eq!(bridge.known_devices().unwrap(), vec![device]);
      assert!(bridge.forget_device(ADDRESS).unwrap());
   }

   #[tokio::test]
   async fn test_connect_last_uses_record() {
      let (store, _dir) = create_test_store();
      let central = MockCentral::named("ESP32");
      let bridge = bridge(central.clone(), &store);
      assert!(!bridge.connect_last().await.unwrap());

      store
         .connection()
         .save(&DeviceIdentity::new(ADDRESS, Some("ESP32")))
         .unwrap();
      assert!(bridge.connect_last().await.unwrap());
      wait_until(&bridge, |s| s.state == ConnectionState::Ready).await;
      assert_eq!(central.connects(), 1);
   }

   #[tokio::test]
   async fn test_wifi_credentials_unwrap_ssid() {
      let (store, _dir) = create_test_store();
      let central = MockCentral::named("ESP32");
      let bridge = bridge(central.clone(), &store);
      bridge.connect(ADDRESS).await.unwrap();
      wait_until(&bridge, |s| s.state == ConnectionState::Ready).await;

      assert!(
         bridge
            .send_wifi_credentials("\"HomeNet\"", "hunter2")
            .await
            .unwrap()
      );
      assert!(matches!(
         bridge.send_wifi_credentials("<unknown ssid>", "x").await,
         Err(BridgeError::InvalidMessage(_))
      ));
      assert_eq!(central.writes(), vec!["wifi|HomeNet|hunter2"]);
   }

   #[tokio::test]
   async fn test_status_reports_scan_and_permission() {
      let (store, _dir) = create_test_store();
      let bridge = bridge(MockCentral::new(), &store);

      bridge.start_scan().unwrap();
      let status = bridge.status().unwrap();
      assert_eq!(status["state"], "disconnected");
      assert_eq!(status["scanning"], true);
      assert_eq!(status["link_permission"], true);

      bridge.set_link_permission(false);
      assert!(matches!(bridge.connect(ADDRESS).await, Err(BridgeError::PermissionDenied)));
      assert!(!bridge.is_source_selected("org.chat").unwrap());
   }
}
