//! In-memory transport for tests

use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::link::{LinkHandle, LinkInput};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, DeviceId, DiscoveryFailure, TransportEvent,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const HANDLE: CharacteristicHandle = CharacteristicHandle(0x2A);
pub const DEVICE: DeviceId = 0x00A0_B1C2_D3E4;

/// A link handle already in `Ready`
pub fn ready_link() -> LinkHandle {
    let link = LinkHandle::new();
    link.apply(LinkInput::Scan);
    link.apply(LinkInput::DeviceFound);
    link.apply(LinkInput::LinkUp);
    link.apply(LinkInput::CharacteristicFound(HANDLE));
    link
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(String),
    StopScan,
    Connect(DeviceId),
    DiscoverServices,
    EnableNotifications(CharacteristicHandle),
    Disconnect,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    written: Vec<Vec<u8>>,
    in_flight: usize,
    max_in_flight: usize,
    write_delay: Option<Duration>,
    fail_next_write: Option<TransportError>,
    auto_ack: bool,
    advertised_name: Option<String>,
    discovery: Option<Result<CharacteristicHandle, DiscoveryFailure>>,
}

pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<MockState>,
    written_changed: Notify,
}

struct InFlightWrite<'a>(&'a MockTransport);

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        self.0.state.lock().unwrap().in_flight -= 1;
    }
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events,
            state: Mutex::new(MockState::default()),
            written_changed: Notify::new(),
        });
        (transport, rx)
    }

    /// Simulate a peripheral that advertises `name` and exposes the characteristic
    pub fn with_peripheral(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport, rx) = Self::new();
        {
            let mut state = transport.state.lock().unwrap();
            state.advertised_name = Some(name.to_string());
            state.discovery = Some(Ok(HANDLE));
        }
        (transport, rx)
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn notify(&self, value: &[u8]) {
        self.emit(TransportEvent::Notification {
            handle: HANDLE,
            value: value.to_vec(),
        });
    }

    pub fn set_discovery(&self, discovery: Option<Result<CharacteristicHandle, DiscoveryFailure>>) {
        self.state.lock().unwrap().discovery = discovery;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    pub fn fail_next_write(&self, error: TransportError) {
        self.state.lock().unwrap().fail_next_write = Some(error);
    }

    /// Answer every block frame with a transfer acknowledgement
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().unwrap().auto_ack = enabled;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn max_concurrent_writes(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub async fn wait_for_writes(&self, count: usize) {
        loop {
            let changed = self.written_changed.notified();
            if self.state.lock().unwrap().written.len() >= count {
                return;
            }
            changed.await;
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl BleTransport for MockTransport {
    fn start_scan(&self, device_name: &str) -> Result<(), TransportError> {
        self.record(Call::StartScan(device_name.to_string()));
        let advertised = self.state.lock().unwrap().advertised_name.clone();
        if let Some(name) = advertised {
            self.emit(TransportEvent::DeviceFound {
                device: DEVICE,
                name: Some(name),
            });
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        Ok(())
    }

    fn connect(&self, device: DeviceId) -> Result<(), TransportError> {
        self.record(Call::Connect(device));
        if self.state.lock().unwrap().advertised_name.is_some() {
            self.emit(TransportEvent::LinkUp);
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.record(Call::DiscoverServices);
        let discovery = self.state.lock().unwrap().discovery;
        if let Some(result) = discovery {
            self.emit(TransportEvent::ServicesDiscovered(result));
        }
        Ok(())
    }

    fn enable_notifications(
        &self,
        handle: CharacteristicHandle,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.record(Call::EnableNotifications(handle));
        async { Ok(()) }
    }

    fn write(
        &self,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            let (delay, failure, auto_ack) = {
                let mut state = self.state.lock().unwrap();
                state.written.push(value.clone());
                state.in_flight += 1;
                state.max_in_flight = state.max_in_flight.max(state.in_flight);
                (
                    state.write_delay,
                    state.fail_next_write.take(),
                    state.auto_ack,
                )
            };
            let _in_flight = InFlightWrite(self);
            self.written_changed.notify_waiters();

            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }

            if let Some(error) = failure {
                return Err(error);
            }
            if auto_ack && value.first() == Some(&12) {
                self.emit(TransportEvent::Notification {
                    handle,
                    value: vec![4],
                });
            }
            Ok(())
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        self.emit(TransportEvent::LinkLost);
        Ok(())
    }
}
