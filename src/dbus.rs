use std::sync::Arc;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bridge::Bridge, error::BridgeError, pipeline::Outcome, protocol::NotificationEvent,
};

pub const BUS_NAME: &str = "org.beeper";
pub const OBJECT_PATH: &str = "/org/beeper/bridge";

impl From<BridgeError> for zbus::fdo::Error {
   fn from(e: BridgeError) -> Self {
      match e {
         BridgeError::InvalidAddress(_) | BridgeError::InvalidMessage(_) => {
            Self::InvalidArgs(e.to_string())
         },
         BridgeError::PermissionDenied => Self::AccessDenied(e.to_string()),
         _ => Self::Failed(e.to_string()),
      }
   }
}

pub struct BridgeService {
   bridge: Arc<Bridge>,
}

impl BridgeService {
   pub const fn new(bridge: Arc<Bridge>) -> Self {
      Self { bridge }
   }
}

#[interface(name = "org.beeper.Bridge")]
impl BridgeService {
   async fn start_scan(&self) -> zbus::fdo::Result<()> {
      Ok(self.bridge.start_scan()?)
   }

   async fn stop_scan(&self) -> bool {
      self.bridge.stop_scan()
   }

   async fn candidates(&self) -> String {
      let candidates: Vec<serde_json::Value> = self
         .bridge
         .candidates()
         .iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::Value::from(candidates).to_string()
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<()> {
      self.bridge.connect(&address).await?;
      info!("Connect requested for {address}");
      Ok(())
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      Ok(self.bridge.disconnect().await?)
   }

   async fn status(&self) -> zbus::fdo::Result<String> {
      Ok(self.bridge.status()?.to_string())
   }

   async fn send_raw(&self, data: String) -> zbus::fdo::Result<bool> {
      Ok(self.bridge.send_raw(&data).await?)
   }

   async fn sync_time(&self) -> zbus::fdo::Result<bool> {
      Ok(self.bridge.sync_time().await?)
   }

   async fn send_wifi_credentials(&self, ssid: String, password: String) -> zbus::fdo::Result<bool> {
      Ok(self.bridge.send_wifi_credentials(&ssid, &password).await?)
   }

   async fn set_source_selected(&self, source: String, selected: bool) -> zbus::fdo::Result<()> {
      Ok(self.bridge.set_source_selected(&source, selected)?)
   }

   async fn is_source_selected(&self, source: String) -> zbus::fdo::Result<bool> {
      Ok(self.bridge.is_source_selected(&source)?)
   }

   async fn selected_sources(&self) -> zbus::fdo::Result<Vec<String>> {
      let sources = self.bridge.sources().get_all()?;
      Ok(sources.into_iter().map(String::from).collect())
   }

   /// Every known source with its flag, as a JSON object.
   async fn sources(&self) -> zbus::fdo::Result<String> {
      let entries: serde_json::Map<String, serde_json::Value> = self
         .bridge
         .sources()
         .entries()?
         .into_iter()
         .map(|(source, selected)| (source.to_string(), selected.into()))
         .collect();
      Ok(serde_json::Value::Object(entries).to_string())
   }

   async fn known_devices(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .bridge
         .known_devices()?
         .iter()
         .map(|d| d.to_json())
         .collect();
      Ok(serde_json::Value::from(devices).to_string())
   }

   async fn forget_device(&self, address: String) -> zbus::fdo::Result<bool> {
      Ok(self.bridge.forget_device(&address)?)
   }

   async fn set_link_permission(&self, granted: bool) {
      self.bridge.set_link_permission(granted);
   }

   /// Feeds a captured notification through the forwarding pipeline.
   async fn post_notification(
      &self,
      source: String,
      title: String,
      body: String,
   ) -> zbus::fdo::Result<String> {
      let event = NotificationEvent::new(source, title, body);
      let outcome = match self.bridge.post_notification(&event).await? {
         Outcome::Skipped => "skipped",
         Outcome::Sent(true) => "sent",
         Outcome::Sent(false) => "rejected",
      };
      Ok(outcome.to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_changed(
      emitter: &SignalEmitter<'_>,
      state: &str,
      address: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_finished(emitter: &SignalEmitter<'_>, count: u32) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notification_forwarded(
      emitter: &SignalEmitter<'_>,
      source: &str,
      delivered: bool,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self.bridge.state().to_str().to_string()
   }
}
