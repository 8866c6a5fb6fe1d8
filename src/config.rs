//! Configuration management for the bridge service.
//!
//! This module handles loading and saving configuration from disk,
//! including adapter selection and link policy parameters.

use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::policy::{Backoff, LinkPolicy, Manual},
   error::{BridgeError, Result},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Adapter to use (e.g. `hci0`); the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   /// Initial state of the link-layer connect permission.
   #[serde(default = "default_link_permission")]
   pub link_permission: bool,

   #[serde(default = "default_time_sync_delay")]
   pub time_sync_delay_ms: u64,

   /// Upper bound on a connect attempt; unbounded when unset.
   #[serde(default)]
   pub connect_timeout_sec: Option<u64>,

   /// Reconnect attempts after an unrequested link loss; 0 disables.
   #[serde(default)]
   pub reconnect_attempts: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_sec: u64,

   /// Reconnect the last persisted device on startup.
   #[serde(default)]
   pub auto_connect_last: bool,
}

const fn default_link_permission() -> bool {
   true
}

const fn default_time_sync_delay() -> u64 {
   1000
}

const fn default_reconnect_delay() -> u64 {
   2
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         link_permission: default_link_permission(),
         time_sync_delay_ms: default_time_sync_delay(),
         connect_timeout_sec: None,
         reconnect_attempts: 0,
         reconnect_delay_sec: default_reconnect_delay(),
         auto_connect_last: false,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(beeper_home) = env::var("BEEPER_HOME") {
         PathBuf::from(beeper_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("beeperd").join("config.toml"))
   }

   pub const fn time_sync_delay(&self) -> Duration {
      Duration::from_millis(self.time_sync_delay_ms)
   }

   pub fn connect_timeout(&self) -> Option<Duration> {
      self.connect_timeout_sec.map(Duration::from_secs)
   }

   pub const fn reconnect_delay(&self) -> Duration {
      Duration::from_secs(self.reconnect_delay_sec)
   }

   /// Link policy described by the reconnect and timeout settings.
   pub fn link_policy(&self) -> Arc<dyn LinkPolicy> {
      if self.reconnect_attempts == 0 && self.connect_timeout_sec.is_none() {
         return Arc::new(Manual);
      }
      Arc::new(Backoff {
         max_attempts: self.reconnect_attempts,
         base_delay: self.reconnect_delay(),
         connect_timeout: self.connect_timeout(),
      })
   }
}
