//! BlueZ central backed by `bluer`.

use std::str::FromStr;

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, ErrorKind, Session, gatt::remote::Characteristic,
};
use futures::{
   FutureExt, StreamExt,
   future::BoxFuture,
   stream::BoxStream,
};
use log::{debug, info, warn};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::backend::{Central, Discovery, GattSession, Link},
   device::DeviceIdentity,
   error::{BridgeError, Result},
};

pub struct BluezCentral {
   _session: Session,
   adapter: Adapter,
}

impl BluezCentral {
   /// Opens `adapter_name`, or the default adapter, and powers it on.
   pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!("Using adapter {}", adapter.name());

      Ok(Self {
         _session: session,
         adapter,
      })
   }
}

impl Central for BluezCentral {
   type Session = BluezSession;

   fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Link<BluezSession>>> {
      async move {
         let addr = Address::from_str(address)
            .map_err(|_| BridgeError::InvalidAddress(address.to_string()))?;
         let device = self.adapter.device(addr)?;

         // Subscribe first so a drop right after connecting is not missed.
         let mut events = device.events().await?;
         if !device.is_connected().await? {
            device.connect().await?;
         }
         let name = device.name().await.ok().flatten().map(SmolStr::from);

         let closed = async move {
            while let Some(event) = events.next().await {
               if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                  debug!("{addr} disconnected");
                  return;
               }
            }
         }
         .boxed();

         Ok(Link {
            session: BluezSession { device },
            name,
            closed,
         })
      }
      .boxed()
   }

   fn cancel<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<()>> {
      async move {
         let addr = Address::from_str(address)
            .map_err(|_| BridgeError::InvalidAddress(address.to_string()))?;
         // Disconnect aborts a pending Connect; a device that never linked is fine.
         match self.adapter.device(addr)?.disconnect().await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind, ErrorKind::NotConnected) => {
               debug!("{addr} was not connected");
               Ok(())
            },
            Err(e) => Err(e.into()),
         }
      }
      .boxed()
   }
}

impl Discovery for BluezCentral {
   fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, DeviceIdentity>>> {
      async move {
         let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
         };
         if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to restrict discovery to LE: {e}");
         }

         let adapter = self.adapter.clone();
         let events = self.adapter.discover_devices().await?;
         let sightings = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
               let AdapterEvent::DeviceAdded(addr) = event else {
                  return None;
               };
               let name = match adapter.device(addr) {
                  Ok(device) => device.name().await.ok().flatten(),
                  Err(_) => None,
               };
               Some(DeviceIdentity::new(addr.to_string(), name))
            }
         });
         Ok(sightings.boxed())
      }
      .boxed()
   }
}

pub struct BluezSession {
   device: Device,
}

impl BluezSession {
   async fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
      for remote in self.device.services().await? {
         if remote.uuid().await? != service {
            continue;
         }
         for candidate in remote.characteristics().await? {
            if candidate.uuid().await? == characteristic {
               return Ok(candidate);
            }
         }
         return Err(BridgeError::CharacteristicNotFound(characteristic));
      }
      Err(BridgeError::ServiceNotFound(service))
   }
}

impl GattSession for BluezSession {
   fn discover_services(&self) -> BoxFuture<'_, Result<()>> {
      async move {
         let mut events = self.device.events().await?;
         if self.device.is_services_resolved().await? {
            return Ok(());
         }
         while let Some(event) = events.next().await {
            match event {
               DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) => {
                  return Ok(());
               },
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => break,
               _ => {},
            }
         }
         Err(BridgeError::TransportFailure(
            "link closed during service discovery".into(),
         ))
      }
      .boxed()
   }

   fn write<'a>(
      &'a self,
      service: Uuid,
      characteristic: Uuid,
      payload: &'a [u8],
   ) -> BoxFuture<'a, Result<bool>> {
      async move {
         let characteristic = self.find_characteristic(service, characteristic).await?;
         characteristic.write(payload).await?;
         Ok(true)
      }
      .boxed()
   }

   fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
      async move {
         self.device.disconnect().await?;
         Ok(())
      }
      .boxed()
   }
}
