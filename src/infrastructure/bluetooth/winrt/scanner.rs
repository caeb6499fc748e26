//! BLE Scanner Module
//!
//! Advertisement watcher reporting every device that advertises the
//! requested local name.

use crate::infrastructure::bluetooth::transport::TransportEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};
use windows::core::HSTRING;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::BluetoothError;
use windows::Foundation::TypedEventHandler;

pub struct AdvertisementScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl AdvertisementScanner {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            watcher: None,
            events,
        }
    }

    pub fn start(&mut self, device_name: &str) -> windows::core::Result<()> {
        // Stop any existing scan
        self.stop()?;

        info!("Starting BLE scan for {}", device_name);
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;
        watcher
            .AdvertisementFilter()?
            .Advertisement()?
            .SetLocalName(&HSTRING::from(device_name))?;

        let sender = self.events.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let _ = sender.send(TransportEvent::DeviceFound {
                        device: args.BluetoothAddress()?,
                        name: (!name.is_empty()).then_some(name),
                    });
                }
                Ok(())
            },
        );
        watcher.Received(&received)?;

        let sender = self.events.clone();
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        warn!("Advertisement watcher stopped: {:?}", error);
                        let _ = sender.send(TransportEvent::ScanFailed { code: error.0 });
                    }
                }
                Ok(())
            },
        );
        watcher.Stopped(&stopped)?;

        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn stop(&mut self) -> windows::core::Result<()> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan");
            watcher.Stop()?;
        }
        Ok(())
    }
}

impl Drop for AdvertisementScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
