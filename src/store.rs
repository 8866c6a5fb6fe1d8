//! Persistent bridge state using heed (LMDB).
//!
//! Three independent namespaces live in one environment: the selected
//! notification sources, the current connection record and the set of
//! devices that have reached a live link at least once. Each namespace is
//! exposed through its own cheaply cloneable handle so components only get
//! the part of the state they own.

use std::{
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::{device::DeviceIdentity, error::Result};

/// Errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create store directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

/// Key of the single record in the connection namespace.
const CONNECTION_KEY: &str = "current";

/// Persisted identity of the bonded peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConnectionRecord {
   pub device: Option<DeviceIdentity>,
   pub is_connected: bool,
}

impl PersistedConnectionRecord {
   pub const fn connected(device: DeviceIdentity) -> Self {
      Self {
         device: Some(device),
         is_connected: true,
      }
   }
}

/// Database layout for bridge state
#[derive(Debug)]
struct Db {
   env: Env,
   /// source id -> opt-in flag
   sources: Database<Str, SerdeBincode<bool>>,
   /// `CONNECTION_KEY` -> record
   connection: Database<Str, SerdeBincode<PersistedConnectionRecord>>,
   /// address -> display name
   known_devices: Database<Str, Str>,
}

/// Owner of the bridge state environment.
#[derive(Clone, Debug)]
pub struct Store {
   db: Arc<Db>,
}

impl Store {
   /// Open or create the store at the default location.
   pub fn open_default() -> Result<Self> {
      Self::open(&Self::db_path()?)
   }

   /// Open or create the store in `path`.
   pub fn open(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path).map_err(Error::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(3)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let sources = env
         .create_database(&mut wtxn, Some("sources"))
         .map_err(Error::DatabaseOperation)?;
      let connection = env
         .create_database(&mut wtxn, Some("connection"))
         .map_err(Error::DatabaseOperation)?;
      let known_devices = env
         .create_database(&mut wtxn, Some("known_devices"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      info!("Opened state store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db {
            env,
            sources,
            connection,
            known_devices,
         }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BEEPER_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/beeperd/state.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("beeperd").join("state.db"))
   }

   pub fn sources(&self) -> SelectedSourceRegistry {
      SelectedSourceRegistry {
         db: self.db.clone(),
      }
   }

   pub fn connection(&self) -> ConnectionStateStore {
      ConnectionStateStore {
         db: self.db.clone(),
      }
   }

   pub fn known_devices(&self) -> KnownDevices {
      KnownDevices {
         db: self.db.clone(),
      }
   }
}

/// Sources the user opted to forward to the peripheral.
#[derive(Clone, Debug)]
pub struct SelectedSourceRegistry {
   db: Arc<Db>,
}

impl SelectedSourceRegistry {
   pub fn set(&self, source: &str, selected: bool) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .sources
         .put(&mut wtxn, source, &selected)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      debug!("Source {source} selected={selected}");
      Ok(())
   }

   /// Opt-in flag for `source`; unknown sources are not selected.
   pub fn get(&self, source: &str) -> Result<bool> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      Ok(self
         .db
         .sources
         .get(&rtxn, source)
         .map_err(Error::DatabaseOperation)?
         .unwrap_or(false))
   }

   /// Every source with its flag, in key order.
   pub fn entries(&self) -> Result<Vec<(SmolStr, bool)>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let mut out = Vec::new();
      for entry in self.db.sources.iter(&rtxn).map_err(Error::DatabaseOperation)? {
         let (source, selected) = entry.map_err(Error::DatabaseOperation)?;
         out.push((SmolStr::new(source), selected));
      }
      Ok(out)
   }

   /// Sources flagged `true`, in key order.
   pub fn get_all(&self) -> Result<Vec<SmolStr>> {
      Ok(self
         .entries()?
         .into_iter()
         .filter_map(|(source, selected)| selected.then_some(source))
         .collect())
   }
}

/// Record of the bonded peripheral, written only by the transport.
#[derive(Clone, Debug)]
pub struct ConnectionStateStore {
   db: Arc<Db>,
}

impl ConnectionStateStore {
   pub fn load(&self) -> Result<PersistedConnectionRecord> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      Ok(self
         .db
         .connection
         .get(&rtxn, CONNECTION_KEY)
         .map_err(Error::DatabaseOperation)?
         .unwrap_or_default())
   }

   pub fn save(&self, device: &DeviceIdentity) -> Result<()> {
      self.put(&PersistedConnectionRecord::connected(device.clone()))
   }

   /// Keeps the identity but drops the connected flag.
   pub fn mark_disconnected(&self) -> Result<()> {
      let mut record = self.load()?;
      if !record.is_connected {
         return Ok(());
      }
      record.is_connected = false;
      self.put(&record)
   }

   pub fn clear(&self) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .connection
         .delete(&mut wtxn, CONNECTION_KEY)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }

   fn put(&self, record: &PersistedConnectionRecord) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .connection
         .put(&mut wtxn, CONNECTION_KEY, record)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }
}

/// Devices that have reached a live link at least once.
#[derive(Clone, Debug)]
pub struct KnownDevices {
   db: Arc<Db>,
}

impl KnownDevices {
   pub fn add(&self, device: &DeviceIdentity) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .known_devices
         .put(&mut wtxn, &device.address, &device.name)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }

   /// Forgets `address`; returns whether it was known.
   pub fn remove(&self, address: &str) -> Result<bool> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let removed = self
         .db
         .known_devices
         .delete(&mut wtxn, address)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(removed)
   }

   pub fn contains(&self, address: &str) -> Result<bool> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      Ok(self
         .db
         .known_devices
         .get(&rtxn, address)
         .map_err(Error::DatabaseOperation)?
         .is_some())
   }

   pub fn list(&self) -> Result<Vec<DeviceIdentity>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let mut out = Vec::new();
      for entry in self
         .db
         .known_devices
         .iter(&rtxn)
         .map_err(Error::DatabaseOperation)?
      {
         let (address, name) = entry.map_err(Error::DatabaseOperation)?;
         out.push(DeviceIdentity::new(address, Some(name)));
      }
      Ok(out)
   }
}
