//! Peripheral identity and link state.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;

/// Name used when a peripheral does not report one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Identity of a peripheral as captured from a scan or a live link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
   pub address: SmolStr,
   pub name: SmolStr,
}

impl DeviceIdentity {
   pub fn new(address: impl Into<SmolStr>, name: Option<impl Into<SmolStr>>) -> Self {
      Self {
         address: address.into(),
         name: name
            .map(Into::into)
            .filter(|n: &SmolStr| !n.is_empty())
            .unwrap_or_else(|| SmolStr::new_static(UNKNOWN_DEVICE_NAME)),
      }
   }

   /// Extracts the address from a `"<name> (<address>)"` list label.
   pub fn address_from_label(label: &str) -> Option<&str> {
      let start = label.rfind('(')? + 1;
      let end = label.rfind(')')?;
      (end > start).then(|| &label[start..end])
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "address": self.address.as_str(),
          "name": self.name.as_str(),
      })
   }
}

impl fmt::Display for DeviceIdentity {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.name, self.address)
   }
}

/// State of the single peripheral link.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum ConnectionState {
   #[default]
   #[strum(serialize = "disconnected")]
   Disconnected,
   #[strum(serialize = "connecting")]
   Connecting,
   #[strum(serialize = "service_discovery")]
   ServiceDiscovery,
   #[strum(serialize = "ready")]
   Ready,
}

impl ConnectionState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_name_falls_back() {
      let id = DeviceIdentity::new("AA:BB:CC:DD:EE:FF", None::<&str>);
      assert_eq!(id.name, UNKNOWN_DEVICE_NAME);
      let id = DeviceIdentity::new("AA:BB:CC:DD:EE:FF", Some(""));
      assert_eq!(id.name, UNKNOWN_DEVICE_NAME);
   }

   #[test]
   fn test_label_round_trip() {
      let id = DeviceIdentity::new("24:6F:28:AA:01:02", Some("ESP32 (beeper)"));
      let label = id.to_string();
      assert_eq!(label, "ESP32 (beeper) (24:6F:28:AA:01:02)");
      assert_eq!(DeviceIdentity::address_from_label(&label), Some("24:6F:28:AA:01:02"));
      assert_eq!(DeviceIdentity::address_from_label("no address"), None);
      assert_eq!(DeviceIdentity::address_from_label("empty ()"), None);
   }

   #[test]
   fn test_state_strings() {
      assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
      assert_eq!(ConnectionState::ServiceDiscovery.to_str(), "service_discovery");
   }
}
