//! WinRT Transport
//!
//! [`BleTransport`] over the Windows Bluetooth LE APIs. Asynchronous WinRT
//! operations run on the tokio runtime that created the transport.

mod connection;
mod scanner;

use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, DeviceId, DiscoveryFailure, TransportEvent,
};
use anyhow::Result;
use connection::GattLink;
use scanner::AdvertisementScanner;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCharacteristic;

pub fn parse_uuid(uuid_str: &str) -> Result<GUID> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 {
        return Err(anyhow::anyhow!("Invalid UUID format"));
    }

    let d1 = u32::from_str_radix(&uuid_str[0..8], 16)?;
    let d2 = u16::from_str_radix(&uuid_str[8..12], 16)?;
    let d3 = u16::from_str_radix(&uuid_str[12..16], 16)?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&uuid_str[16 + i * 2..18 + i * 2], 16)?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::Failed(e.to_string())
}

pub struct WinRtTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    runtime: Handle,
    service_uuid: GUID,
    characteristic_uuid: GUID,
    scanner: Mutex<AdvertisementScanner>,
    link: Arc<Mutex<Option<GattLink>>>,
}

impl WinRtTransport {
    /// Must be called from within a tokio runtime
    pub fn new(
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            runtime: Handle::try_current()?,
            service_uuid: parse_uuid(service_uuid)?,
            characteristic_uuid: parse_uuid(characteristic_uuid)?,
            scanner: Mutex::new(AdvertisementScanner::new(events.clone())),
            link: Arc::new(Mutex::new(None)),
            events,
        });
        Ok((transport, rx))
    }

    fn characteristic(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<GattCharacteristic, TransportError> {
        let link = lock(&self.link);
        match link.as_ref().and_then(|l| l.characteristic.as_ref()) {
            Some((characteristic, _))
                if connection::handle_of(characteristic).ok() == Some(handle) =>
            {
                Ok(characteristic.clone())
            }
            _ => Err(TransportError::Failed(format!(
                "no characteristic with handle {:?}",
                handle
            ))),
        }
    }
}

impl BleTransport for WinRtTransport {
    fn start_scan(&self, device_name: &str) -> Result<(), TransportError> {
        lock(&self.scanner).start(device_name).map_err(|e| {
            // 0x8007048F: the radio is off or missing
            if e.code().0 as u32 == 0x8007_048F {
                TransportError::Unavailable
            } else {
                failed(e)
            }
        })
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        lock(&self.scanner).stop().map_err(failed)
    }

    fn connect(&self, device: DeviceId) -> Result<(), TransportError> {
        let events = self.events.clone();
        let link = self.link.clone();
        self.runtime.spawn(async move {
            match connection::open(device, events.clone()).await {
                Ok(gatt) => {
                    let stale = lock(&link).replace(gatt);
                    if let Some(stale) = stale {
                        stale.close();
                    }
                    let _ = events.send(TransportEvent::LinkUp);
                }
                Err(e) => {
                    error!("Connection to {:#X} failed: {:#}", device, e);
                    let _ = events.send(TransportEvent::LinkLost);
                }
            }
        });
        Ok(())
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let device = lock(&self.link)
            .as_ref()
            .map(|l| l.device.clone())
            .ok_or_else(|| TransportError::Failed("not connected".to_string()))?;
        let events = self.events.clone();
        let link = self.link.clone();
        let (service_uuid, characteristic_uuid) = (self.service_uuid, self.characteristic_uuid);

        self.runtime.spawn(async move {
            let found =
                connection::find_characteristic(&device, service_uuid, characteristic_uuid).await;
            let result = found.and_then(|characteristic| {
                let status = |e: windows::core::Error| DiscoveryFailure::Status(e.code().0);
                let handle = connection::handle_of(&characteristic).map_err(status)?;
                let token =
                    connection::forward_values(&characteristic, events.clone()).map_err(status)?;
                if let Some(gatt) = lock(&link).as_mut() {
                    gatt.characteristic = Some((characteristic, token));
                }
                info!("Found characteristic with handle {:?}", handle);
                Ok(handle)
            });
            let _ = events.send(TransportEvent::ServicesDiscovered(result));
        });
        Ok(())
    }

    fn enable_notifications(
        &self,
        handle: CharacteristicHandle,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let characteristic = self.characteristic(handle);
        async move {
            let characteristic = characteristic?;
            connection::enable_notifications(&characteristic)
                .await
                .map_err(|e| TransportError::Failed(format!("{:#}", e)))
        }
    }

    fn write(
        &self,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let characteristic = self.characteristic(handle);
        async move {
            let characteristic = characteristic?;
            connection::write_value(&characteristic, &value)
                .await
                .map_err(|e| TransportError::Failed(format!("{:#}", e)))
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(gatt) = lock(&self.link).take() {
            gatt.close();
            info!("Closed GATT connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};

    #[test]
    fn test_parse_uuid() {
        let guid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(guid.data1, 0x695ba701);
        assert_eq!(guid.data4[7], 0x9f);

        let guid = parse_uuid(CHARACTERISTIC_UUID).unwrap();
        assert_eq!(guid.data2, 0x086f);
        assert!(parse_uuid("695ba701").is_err());
    }
}
