//! Transport Boundary
//!
//! The radio stack is reached only through [`BleTransport`]. Operations that
//! complete later (scan hits, link changes, discovery, inbound values) are
//! reported as [`TransportEvent`]s on the channel handed to the backend when
//! it is created.

use crate::infrastructure::bluetooth::error::TransportError;
use std::future::Future;

/// Bluetooth address of a discovered peripheral
pub type DeviceId = u64;

/// Opaque handle of a GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u16);

/// Why service discovery did not yield the characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryFailure {
    ServiceNotFound,
    CharacteristicNotFound,
    Status(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceFound {
        device: DeviceId,
        name: Option<String>,
    },
    ScanFailed {
        code: i32,
    },
    LinkUp,
    LinkLost,
    ServicesDiscovered(Result<CharacteristicHandle, DiscoveryFailure>),
    Notification {
        handle: CharacteristicHandle,
        value: Vec<u8>,
    },
}

/// BLE central-role operations the engine needs
pub trait BleTransport: Send + Sync + 'static {
    /// Start scanning for peripherals advertising `device_name`
    fn start_scan(&self, device_name: &str) -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open a GATT session; [`TransportEvent::LinkUp`] follows on success
    fn connect(&self, device: DeviceId) -> Result<(), TransportError>;

    /// Look up the THMIC64 service; [`TransportEvent::ServicesDiscovered`] follows
    fn discover_services(&self) -> Result<(), TransportError>;

    fn enable_notifications(
        &self,
        handle: CharacteristicHandle,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Write a value; resolves once the stack reports low-level completion
    fn write(
        &self,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> Result<(), TransportError>;
}
