//! Central-role capabilities the bridge is layered on.
//!
//! The transport and scan coordinator only speak to the platform through
//! these traits; BlueZ implements them in production and an in-memory
//! backend stands in for it in tests.

use futures::{future::BoxFuture, stream::BoxStream};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{device::DeviceIdentity, error::Result};

/// An established link to a peripheral.
pub struct Link<S> {
   pub session: S,
   /// Name reported by the peripheral, if any.
   pub name: Option<SmolStr>,
   /// Resolves once the underlying link drops.
   pub closed: BoxFuture<'static, ()>,
}

/// Connects to peripherals in the central role.
pub trait Central: Send + Sync + 'static {
   type Session: GattSession;

   /// Resolves once the link to `address` is established.
   fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Link<Self::Session>>>;

   /// Abandons a connect to `address` that has not produced a link yet.
   fn cancel<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// GATT client operations on a live link.
pub trait GattSession: Send + Sync + 'static {
   /// Resolves once the remote GATT database can be queried.
   fn discover_services(&self) -> BoxFuture<'_, Result<()>>;

   /// Submits a write of `payload` to `characteristic` under `service`.
   ///
   /// Fails with `ServiceNotFound` / `CharacteristicNotFound` when the
   /// peripheral does not expose them; otherwise yields whether the platform
   /// accepted the request.
   fn write<'a>(
      &'a self,
      service: Uuid,
      characteristic: Uuid,
      payload: &'a [u8],
   ) -> BoxFuture<'a, Result<bool>>;

   fn disconnect(&self) -> BoxFuture<'_, Result<()>>;
}

/// Streams nearby peripherals.
pub trait Discovery: Send + Sync + 'static {
   /// Starts discovery; it runs until the returned stream is dropped.
   fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, DeviceIdentity>>>;
}
