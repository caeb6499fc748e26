//! BLE Connection Module
//!
//! Device connection and GATT access for the THMIC64 characteristic.

use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, DeviceId, DiscoveryFailure, TransportEvent,
};
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// An open connection to the peripheral
pub struct GattLink {
    pub device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
    pub characteristic: Option<(GattCharacteristic, i64)>,
}

impl GattLink {
    pub fn close(self) {
        if let Some((characteristic, token)) = self.characteristic {
            let _ = characteristic.RemoveValueChanged(token);
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        if let Some(session) = self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}

/// Connect to the device at `address` and watch its connection status
pub async fn open(
    address: DeviceId,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<GattLink> {
    info!("Connecting to Bluetooth device: {:#X}", address);
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

    // Keeps Windows from dropping the link between writes
    let session = match create_gatt_session(&device).await {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("Failed to create GattSession, continuing anyway: {}", e);
            None
        }
    };

    let status_handler =
        TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                    let _ = events.send(TransportEvent::LinkLost);
                }
            }
            Ok(())
        });
    let status_token = device.ConnectionStatusChanged(&status_handler)?;

    Ok(GattLink {
        device,
        session,
        status_token,
        characteristic: None,
    })
}

async fn create_gatt_session(device: &BluetoothLEDevice) -> Result<GattSession> {
    let device_id = device.BluetoothDeviceId()?;
    let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
    session.SetMaintainConnection(true)?;
    Ok(session)
}

fn status_failure(e: windows::core::Error) -> DiscoveryFailure {
    DiscoveryFailure::Status(e.code().0)
}

/// Look up the service and its characteristic
pub async fn find_characteristic(
    device: &BluetoothLEDevice,
    service_uuid: GUID,
    characteristic_uuid: GUID,
) -> Result<GattCharacteristic, DiscoveryFailure> {
    let services = device
        .GetGattServicesForUuidAsync(service_uuid)
        .map_err(status_failure)?
        .await
        .map_err(status_failure)?;
    let status = services.Status().map_err(status_failure)?;
    if status != GattCommunicationStatus::Success {
        error!("Failed to get GATT services: {:?}", status);
        return Err(DiscoveryFailure::Status(status.0));
    }

    let services = services.Services().map_err(status_failure)?;
    if services.Size().map_err(status_failure)? == 0 {
        return Err(DiscoveryFailure::ServiceNotFound);
    }
    let service = services.GetAt(0).map_err(status_failure)?;

    let characteristics = service
        .GetCharacteristicsForUuidAsync(characteristic_uuid)
        .map_err(status_failure)?
        .await
        .map_err(status_failure)?;
    let status = characteristics.Status().map_err(status_failure)?;
    if status != GattCommunicationStatus::Success {
        return Err(DiscoveryFailure::Status(status.0));
    }

    let characteristics = characteristics.Characteristics().map_err(status_failure)?;
    if characteristics.Size().map_err(status_failure)? == 0 {
        return Err(DiscoveryFailure::CharacteristicNotFound);
    }
    characteristics.GetAt(0).map_err(status_failure)
}

pub fn handle_of(characteristic: &GattCharacteristic) -> windows::core::Result<CharacteristicHandle> {
    Ok(CharacteristicHandle(characteristic.AttributeHandle()?))
}

/// Forward every value change as a notification event
pub fn forward_values(
    characteristic: &GattCharacteristic,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> windows::core::Result<i64> {
    let handle = handle_of(characteristic)?;
    let data_handler = TypedEventHandler::new(
        move |_: windows::core::Ref<GattCharacteristic>,
              args: windows::core::Ref<GattValueChangedEventArgs>| {
            if let Some(args) = args.as_ref() {
                let buffer = args.CharacteristicValue()?;
                let reader = DataReader::FromBuffer(&buffer)?;
                let mut value = vec![0u8; buffer.Length()? as usize];
                reader.ReadBytes(&mut value)?;
                let _ = events.send(TransportEvent::Notification { handle, value });
            }
            Ok(())
        },
    );
    characteristic.ValueChanged(&data_handler)
}

/// Enable notifications, retrying while Windows shows a pairing prompt
pub async fn enable_notifications(characteristic: &GattCharacteristic) -> Result<()> {
    info!("Enabling notifications...");

    for attempt in 1..=3 {
        match characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await
        {
            Ok(GattCommunicationStatus::Success) => {
                info!("Notifications enabled");
                return Ok(());
            }
            Ok(status) => {
                warn!("Notification subscription returned status: {:?}", status);
            }
            Err(e) => {
                warn!("Notification subscription attempt {} failed: {}", attempt, e);
            }
        }
        if attempt < 3 {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        }
    }

    anyhow::bail!("Failed to enable notifications")
}

pub async fn write_value(characteristic: &GattCharacteristic, value: &[u8]) -> Result<()> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(value)?;
    let buffer = writer.DetachBuffer()?;

    let status = characteristic.WriteValueAsync(&buffer)?.await?;
    if status != GattCommunicationStatus::Success {
        anyhow::bail!("write returned status {:?}", status);
    }
    Ok(())
}
