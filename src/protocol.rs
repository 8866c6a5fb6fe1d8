//! Wire protocol spoken to the peripheral.
//!
//! Messages are UTF-8 text, pipe-delimited, written as a single value to
//! one characteristic of one fixed service: `kind|field1|field2|...`.
//! Fields are not escaped, so a field containing the delimiter shifts the
//! framing on the receiving side. Such messages are still sent but flagged.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Local, Timelike};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// GATT service exposed by the peripheral firmware.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
/// Write characteristic under [`SERVICE_UUID`] receiving serialized messages.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

pub const DELIMITER: char = '|';

/// SSID reported by the host when no network is associated.
const UNKNOWN_SSID: &str = "<unknown ssid>";

/// Kinds of messages understood by the peripheral.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum MessageKind {
   #[strum(serialize = "notification")]
   Notification,
   #[strum(serialize = "time")]
   TimeSync,
   #[strum(serialize = "wifi")]
   WifiCredentials,
}

impl MessageKind {
   /// Number of fields following the kind tag.
   pub const fn arity(self) -> usize {
      match self {
         Self::Notification => 3,
         Self::TimeSync => 6,
         Self::WifiCredentials => 2,
      }
   }
}

/// A notification observed by the host listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
   pub source_id: SmolStr,
   pub title: String,
   pub body: String,
   pub observed_at: DateTime<Local>,
}

impl NotificationEvent {
   pub fn new(
      source_id: impl Into<SmolStr>,
      title: impl Into<String>,
      body: impl Into<String>,
   ) -> Self {
      Self {
         source_id: source_id.into(),
         title: title.into(),
         body: body.into(),
         observed_at: Local::now(),
      }
   }
}

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
   kind: MessageKind,
   fields: Vec<SmolStr>,
}

impl WireMessage {
   pub fn new<I, S>(kind: MessageKind, fields: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<SmolStr>,
   {
      Self {
         kind,
         fields: fields.into_iter().map(Into::into).collect(),
      }
   }

   pub fn notification(event: &NotificationEvent) -> Self {
      Self::new(
         MessageKind::Notification,
         [
            event.source_id.clone(),
            SmolStr::new(&event.title),
            SmolStr::new(&event.body),
         ],
      )
   }

   /// Clock synchronisation message; month is 1-based, nothing is zero padded.
   pub fn time_sync<T: Datelike + Timelike>(now: &T) -> Self {
      Self::new(
         MessageKind::TimeSync,
         [
            now.hour().to_string(),
            now.minute().to_string(),
            now.second().to_string(),
            now.day().to_string(),
            now.month().to_string(),
            now.year().to_string(),
         ],
      )
   }

   pub fn wifi_credentials(ssid: &str, password: &str) -> Self {
      Self::new(MessageKind::WifiCredentials, [ssid, password])
   }

   pub const fn kind(&self) -> MessageKind {
      self.kind
   }

   pub fn fields(&self) -> &[SmolStr] {
      &self.fields
   }

   /// Whether any field contains the delimiter and would corrupt framing.
   pub fn has_framing_hazard(&self) -> bool {
      self.fields.iter().any(|f| f.contains(DELIMITER))
   }

   pub fn to_bytes(&self) -> Vec<u8> {
      self.to_string().into_bytes()
   }
}

impl fmt::Display for WireMessage {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.kind.into())?;
      for field in &self.fields {
         write!(f, "{DELIMITER}{field}")?;
      }
      Ok(())
   }
}

impl FromStr for WireMessage {
   type Err = BridgeError;

   fn from_str(s: &str) -> Result<Self> {
      let mut parts = s.split(DELIMITER);
      let tag = parts.next().unwrap_or_default();
      let kind = MessageKind::from_str(tag)
         .map_err(|_| BridgeError::InvalidMessage(format!("unknown kind {tag:?}")))?;
      let fields: Vec<SmolStr> = parts.map(SmolStr::new).collect();
      if fields.len() != kind.arity() {
         return Err(BridgeError::InvalidMessage(format!(
            "{kind} expects {} fields, got {}",
            kind.arity(),
            fields.len()
         )));
      }
      Ok(Self { kind, fields })
   }
}

/// Cleans an SSID as reported by the host network stack.
///
/// Quoted names are unwrapped; the placeholder reported when no network
/// is associated yields `None`.
pub fn normalize_ssid(raw: &str) -> Option<SmolStr> {
   let ssid = raw
      .strip_prefix('"')
      .and_then(|s| s.strip_suffix('"'))
      .unwrap_or(raw);
   if ssid.is_empty() || ssid == UNKNOWN_SSID {
      None
   } else {
      Some(SmolStr::new(ssid))
   }
}
