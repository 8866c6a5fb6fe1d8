//! Notification forwarding.
//!
//! Every captured notification is checked against the selected-source
//! registry; only opted-in sources are framed and handed to the transport.
//! Delivery is at most once: nothing is buffered or retried.

use log::{debug, warn};

use crate::{
   bluetooth::transport::BleTransport,
   error::Result,
   event::{BridgeEvent, EventSender},
   protocol::{NotificationEvent, WireMessage},
   store::SelectedSourceRegistry,
};

/// What happened to a captured notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
   /// Source not opted in; nothing was sent.
   Skipped,
   /// Handed to the transport, which reported whether the write was accepted.
   Sent(bool),
}

#[derive(Clone)]
pub struct NotificationPipeline {
   registry: SelectedSourceRegistry,
   transport: BleTransport,
   event_tx: EventSender,
}

impl NotificationPipeline {
   pub const fn new(
      registry: SelectedSourceRegistry,
      transport: BleTransport,
      event_tx: EventSender,
   ) -> Self {
      Self {
         registry,
         transport,
         event_tx,
      }
   }

   pub async fn handle(&self, event: &NotificationEvent) -> Result<Outcome> {
      if !self.registry.get(&event.source_id)? {
         debug!("Skipping notification from {}", event.source_id);
         return Ok(Outcome::Skipped);
      }

      let message = WireMessage::notification(event);
      if message.has_framing_hazard() {
         warn!(
            "Notification from {} contains the field delimiter, peripheral may misparse it",
            event.source_id
         );
      }

      let result = self.transport.send(message.to_bytes()).await;
      self.event_tx.emit(BridgeEvent::NotificationForwarded {
         source: event.source_id.clone(),
         delivered: matches!(result, Ok(true)),
      });
      result.map(Outcome::Sent)
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use smol_str::SmolStr;
   use tokio::time;

   use super::*;
   use crate::{
      bluetooth::{
         mock::MockCentral,
         permission::PermissionGate,
         policy::Manual,
      },
      device::ConnectionState,
      error::BridgeError,
      event::testing::RecordingBus,
      store::{Store, tests::create_test_store},
   };

   async fn ready_pipeline(
      store: &Store,
      bus: Arc<RecordingBus>,
   ) -> (NotificationPipeline, Arc<MockCentral>) {
      let central = MockCentral::named("ESP32");
      let transport = BleTransport::spawn(
         central.clone(),
         store,
         Arc::new(PermissionGate::new(true)),
         Arc::new(Manual),
         bus.clone(),
      );
      transport.connect("24:6F:28:AA:01:02").await.unwrap();
      let mut rx = transport.subscribe();
      time::timeout(
         Duration::from_secs(10),
         rx.wait_for(|s| s.state == ConnectionState::Ready),
      )
      .await
      .unwrap()
      .map(|_| ())
      .unwrap();
      (NotificationPipeline::new(store.sources(), transport, bus), central)
   }

   #[tokio::test]
   async fn test_selected_source_is_forwarded() {
      let (store, _dir) = create_test_store();
      let bus = RecordingBus::new();
      let (pipeline, central) = ready_pipeline(&store, bus.clone()).await;
      store.sources().set("com.example.chat", true).unwrap();

      let event = NotificationEvent::new("com.example.chat", "Alice", "hi");
      assert_eq!(pipeline.handle(&event).await.unwrap(), Outcome::Sent(true));
      assert_eq!(central.writes(), vec!["notification|com.example.chat|Alice|hi"]);
      assert!(bus.events().contains(&BridgeEvent::NotificationForwarded {
         source: SmolStr::new("com.example.chat"),
         delivered: true,
      }));
   }

   #[tokio::test]
   async fn test_unselected_sources_never_reach_transport() {
      let (store, _dir) = create_test_store();
      let (pipeline, central) = ready_pipeline(&store, RecordingBus::new()).await;
      store.sources().set("com.example.mail", false).unwrap();

      for source in ["com.example.mail", "com.example.unknown"] {
         let event = NotificationEvent::new(source, "t", "b");
         assert_eq!(pipeline.handle(&event).await.unwrap(), Outcome::Skipped);
      }
      assert!(central.writes().is_empty());
   }

   #[tokio::test]
   async fn test_delimiter_in_fields_is_sent_unescaped() {
      let (store, _dir) = create_test_store();
      let (pipeline, central) = ready_pipeline(&store, RecordingBus::new()).await;
      store.sources().set("org.chat", true).unwrap();

      let event = NotificationEvent::new("org.chat", "a|b", "c");
      assert_eq!(pipeline.handle(&event).await.unwrap(), Outcome::Sent(true));
      assert_eq!(central.writes(), vec!["notification|org.chat|a|b|c"]);
   }

   #[tokio::test]
   async fn test_send_failure_is_reported_once() {
      let (store, _dir) = create_test_store();
      let bus = RecordingBus::new();
      let transport = BleTransport::spawn(
         MockCentral::new(),
         &store,
         Arc::new(PermissionGate::new(true)),
         Arc::new(Manual),
         bus.clone(),
      );
      let pipeline = NotificationPipeline::new(store.sources(), transport, bus.clone());
      store.sources().set("org.chat", true).unwrap();

      let event = NotificationEvent::new("org.chat", "t", "b");
      assert!(matches!(
         pipeline.handle(&event).await,
         Err(BridgeError::NoActiveConnection)
      ));
      assert_eq!(
         bus.events(),
         vec![BridgeEvent::NotificationForwarded {
            source: SmolStr::new("org.chat"),
            delivered: false,
         }]
      );
   }
}
