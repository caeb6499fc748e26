//! Remote Service Module
//!
//! Connection manager for the THMIC64 peripheral. One event-loop task
//! consumes [`TransportEvent`]s, drives the link state machine and routes
//! decoded notifications. Everything the application needs goes through
//! [`RemoteService`].

use crate::domain::keyboard::{
    release_delay, JoystickDirection, KeyCode, ModifierKey, ModifierLatch,
};
use crate::domain::models::{LinkState, Notification, NotificationKind, SettingsSnapshot};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::error::{
    LinkError, QueryError, TransferError, WriteError,
};
use crate::infrastructure::bluetooth::link::{
    wait_until_not_ready, LinkHandle, LinkInput, LinkStatus,
};
use crate::infrastructure::bluetooth::protocol::{self, Command, Frame};
use crate::infrastructure::bluetooth::router::NotificationRouter;
use crate::infrastructure::bluetooth::transfer::{
    BulkTransferSession, TransferConfig, TransferHandle,
};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, DeviceId, DiscoveryFailure, TransportEvent,
};
use crate::infrastructure::bluetooth::write_gate::WriteGate;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// When to poll the battery voltage while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatterySchedule {
    pub first_check: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub device_name: String,
    pub scan_duration: Duration,
    pub write_timeout: Duration,
    pub query_timeout: Duration,
    pub min_key_pressed: Duration,
    pub transfer: TransferConfig,
    pub battery: Option<BatterySchedule>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RemoteConfig {
    fn from(s: &Settings) -> Self {
        Self {
            device_name: s.device_name.clone(),
            scan_duration: Duration::from_millis(s.scan_duration_ms),
            write_timeout: Duration::from_millis(s.write_timeout_ms),
            query_timeout: Duration::from_millis(s.query_timeout_ms),
            min_key_pressed: Duration::from_millis(s.min_key_pressed_duration_ms),
            transfer: TransferConfig {
                ack_timeout: Duration::from_millis(s.ack_timeout_ms),
                ack_timeout_policy: s.ack_timeout_policy,
            },
            battery: s.battery_monitor_enabled.then(|| BatterySchedule {
                first_check: Duration::from_millis(s.battery_first_check_ms),
                interval: Duration::from_millis(s.battery_check_interval_ms),
            }),
        }
    }
}

struct Shared<T> {
    transport: Arc<T>,
    link: LinkHandle,
    gate: Arc<WriteGate<T>>,
    router: Arc<NotificationRouter>,
    config: RemoteConfig,
    /// Bumped whenever a scan ends; a scan timer only fires for its own scan
    scan_generation: AtomicU64,
    device: Mutex<Option<DeviceId>>,
    transfer_active: Arc<AtomicBool>,
    modifiers: Mutex<ModifierLatch>,
    /// Last switches echoed by the peripheral
    emulator: Mutex<Option<SettingsSnapshot>>,
}

/// Clears the single-transfer flag when the session ends
struct ActiveTransfer(Arc<AtomicBool>);

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Main service coordinating all BLE operations
pub struct RemoteService<T: BleTransport> {
    shared: Arc<Shared<T>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: BleTransport> RemoteService<T> {
    /// Start the event loop over `events`, the channel `transport` reports on
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<T>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: RemoteConfig,
    ) -> Self {
        let link = LinkHandle::new();
        let gate = Arc::new(WriteGate::new(
            transport.clone(),
            link.clone(),
            config.write_timeout,
        ));
        let shared = Arc::new(Shared {
            transport,
            link,
            gate,
            router: Arc::new(NotificationRouter::new()),
            config,
            scan_generation: AtomicU64::new(0),
            device: Mutex::new(None),
            transfer_active: Arc::new(AtomicBool::new(false)),
            modifiers: Mutex::new(ModifierLatch::new()),
            emulator: Mutex::new(None),
        });

        let mut tasks = vec![tokio::spawn(run_event_loop(shared.clone(), events))];
        if let Some(schedule) = shared.config.battery {
            tasks.push(tokio::spawn(run_battery_monitor(shared.clone(), schedule)));
        }

        Self { shared, tasks }
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.link.state()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.shared.link.status()
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkStatus> {
        self.shared.link.watch()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.link.is_ready()
    }

    /// Address of the peripheral picked by the last scan
    pub fn connected_device(&self) -> Option<DeviceId> {
        *lock(&self.shared.device)
    }

    /// Start scanning for the configured device name
    ///
    /// Does nothing unless the link is `Disconnected`. The scan stops on the
    /// first matching device or when the scan duration runs out.
    pub fn scan(&self) -> Result<(), LinkError> {
        let shared = &self.shared;
        if !shared.link.apply(LinkInput::Scan).is_moved() {
            debug!("Scan requested in state {}, ignored", shared.link.state());
            return Ok(());
        }

        let generation = shared.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Scanning for {}", shared.config.device_name);
        if let Err(e) = shared.transport.start_scan(&shared.config.device_name) {
            let error = LinkError::from(e);
            shared.fail_link(error.clone());
            return Err(error);
        }

        let timer = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timer.config.scan_duration).await;
            if timer.scan_generation.load(Ordering::SeqCst) != generation
                || timer.link.state() != LinkState::Scanning
            {
                return;
            }
            if let Err(e) = timer.transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
            timer.fail_link(LinkError::ScanTimeout {
                device_name: timer.config.device_name.clone(),
            });
        });

        Ok(())
    }

    /// Scan and wait until the link is ready or has failed
    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut status = self.shared.link.watch();
        self.scan()?;

        let outcome = status
            .wait_for(|s| matches!(s.state, LinkState::Ready | LinkState::Disconnected))
            .await
            .map(|s| s.clone());

        match outcome {
            Ok(LinkStatus {
                state: LinkState::Ready,
                ..
            }) => Ok(()),
            Ok(status) => Err(status.last_error.unwrap_or(LinkError::NotReady)),
            Err(_) => Err(LinkError::LinkLost),
        }
    }

    /// User-initiated disconnect; leaves no error behind
    ///
    /// The link is `Disconnected` before the transport is told, so the
    /// transport's own link-lost report finds nothing left to fail.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let state = shared.link.state();
        if state == LinkState::Disconnected {
            return;
        }
        shared.link.apply(LinkInput::LinkLost);

        if state == LinkState::Scanning {
            shared.scan_generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = shared.transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        } else if let Err(e) = shared.transport.disconnect() {
            warn!("Disconnect failed: {}", e);
        }
        info!("Disconnected from device");
    }

    /// Switches from the most recent settings notification, if one arrived
    pub fn emulator_settings(&self) -> Option<SettingsSnapshot> {
        lock(&self.shared.emulator).clone()
    }

    pub fn subscribe(&self, kind: NotificationKind) -> mpsc::UnboundedReceiver<Notification> {
        self.shared.router.subscribe(kind)
    }

    pub fn register<F>(&self, kind: NotificationKind, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.router.register(kind, handler);
    }

    pub fn unregister(&self, kind: NotificationKind) {
        self.shared.router.unregister(kind);
    }

    /// Write raw bytes as one frame
    pub async fn send_command(&self, bytes: &[u8], blocking: bool) -> Result<(), WriteError> {
        self.shared.gate.send(Frame::from_bytes(bytes), blocking).await
    }

    pub async fn send(&self, command: &Command, blocking: bool) -> Result<(), WriteError> {
        debug!("Sending {:?}", command);
        self.shared.gate.send(command.to_frame(), blocking).await
    }

    /// Latched on-screen modifiers applied to the next key
    pub fn modifiers(&self) -> MutexGuard<'_, ModifierLatch> {
        lock(&self.shared.modifiers)
    }

    pub async fn press_key(&self, key: KeyCode) -> Result<(), WriteError> {
        let frame = self.modifiers().key_frame(key);
        self.shared.gate.send(frame, false).await
    }

    /// On-screen shift, ctrl or commodore key pressed
    ///
    /// Latches the modifier, or sends it as a plain key when the peripheral
    /// reports raw key codes.
    pub async fn press_modifier(&self, key: ModifierKey) -> Result<(), WriteError> {
        let frame = self.modifiers().press(key);
        match frame {
            Some(frame) => self.shared.gate.send(frame, false).await,
            None => Ok(()),
        }
    }

    /// Send the key-released frame, delayed so the key counts as held for
    /// at least the minimum key-pressed duration
    ///
    /// Nothing is sent once the peripheral reports release detection off.
    pub async fn release_key_after(&self, held_for: Duration) -> Result<(), WriteError> {
        let detect = lock(&self.shared.emulator)
            .as_ref()
            .map_or(true, |s| s.detect_release_key);
        if !detect {
            trace!("Release detection is off, key release not sent");
            return Ok(());
        }

        let delay = release_delay(held_for, self.shared.config.min_key_pressed);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.shared.gate.send(protocol::key_released(), false).await
    }

    pub async fn joystick(
        &self,
        direction: JoystickDirection,
        pressed: bool,
    ) -> Result<(), WriteError> {
        self.shared.gate.send(direction.frame(pressed), false).await
    }

    /// RESTORE, turned into RESTORE + RUN/STOP by a latched commodore key
    pub async fn restore(&self) -> Result<(), WriteError> {
        let command = self.modifiers().restore();
        self.send(&command, false).await
    }

    /// Upload `buffer` on a background task
    pub fn start_bulk_transfer(&self, buffer: Vec<u8>) -> Result<TransferHandle, TransferError> {
        let shared = &self.shared;
        if shared.transfer_active.swap(true, Ordering::SeqCst) {
            return Err(TransferError::AlreadyInProgress);
        }
        let active = ActiveTransfer(shared.transfer_active.clone());

        let (acks, lease) = shared.router.lease(NotificationKind::TransferAck);
        let session = BulkTransferSession::new(
            buffer,
            shared.gate.clone(),
            shared.link.clone(),
            acks,
            shared.config.transfer,
        )?;
        Ok(session.spawn_holding((active, lease)))
    }

    /// Send `command` and wait for the next notification of `kind`
    ///
    /// The query borrows the subscriber slot for `kind` until it returns;
    /// whoever held it before gets it back afterwards.
    pub async fn query(
        &self,
        command: &Command,
        kind: NotificationKind,
    ) -> Result<Notification, QueryError> {
        let shared = &self.shared;
        let (mut responses, _lease) = shared.router.lease(kind);
        let mut status = shared.link.watch();
        self.send(command, true).await?;

        let response = tokio::time::timeout(shared.config.query_timeout, responses.recv());
        tokio::select! {
            biased;
            _ = wait_until_not_ready(&mut status) => Err(QueryError::LinkLost(kind)),
            result = response => match result {
                Ok(Some(notification)) => Ok(notification),
                Ok(None) => Err(QueryError::Replaced(kind)),
                Err(_) => Err(QueryError::Timeout(kind)),
            },
        }
    }
}

impl<T: BleTransport> Drop for RemoteService<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: BleTransport> Shared<T> {
    fn fail_link(&self, error: LinkError) {
        if self.link.state() != LinkState::Disconnected {
            error!("Link failed: {}", error);
        }
        self.link.fail(error);
    }

    /// Tear down the GATT session after a setup failure
    fn abandon(&self, error: LinkError) {
        if let Err(e) = self.transport.disconnect() {
            warn!("Disconnect failed: {}", e);
        }
        self.fail_link(error);
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceFound { device, name } => self.on_device_found(device, name),
            TransportEvent::ScanFailed { code } => {
                if self.link.state() == LinkState::Scanning {
                    self.scan_generation.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = self.transport.stop_scan() {
                        warn!("Failed to stop scan: {}", e);
                    }
                    self.fail_link(LinkError::ScanFailed(code));
                }
            }
            TransportEvent::LinkUp => {
                if !self.link.apply(LinkInput::LinkUp).is_moved() {
                    return;
                }
                info!("Connected to GATT server");
                if let Err(e) = self.transport.discover_services() {
                    self.abandon(e.into());
                }
            }
            TransportEvent::ServicesDiscovered(result) => self.on_services_discovered(result).await,
            TransportEvent::LinkLost => {
                // Only a connection can be lost; anything earlier is a stale report
                if !matches!(
                    self.link.state(),
                    LinkState::Disconnected | LinkState::Scanning
                ) {
                    self.fail_link(LinkError::LinkLost);
                }
            }
            TransportEvent::Notification { handle, value } => self.on_notification(handle, &value),
        }
    }

    fn on_device_found(&self, device: DeviceId, name: Option<String>) {
        if name.as_deref() != Some(self.config.device_name.as_str()) {
            trace!("Ignoring device {:012X} ({:?})", device, name);
            return;
        }
        if !self.link.apply(LinkInput::DeviceFound).is_moved() {
            return;
        }

        self.scan_generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.transport.stop_scan() {
            warn!("Failed to stop scan: {}", e);
        }
        *lock(&self.device) = Some(device);

        info!("Found {} at {:012X}, connecting", self.config.device_name, device);
        if let Err(e) = self.transport.connect(device) {
            self.fail_link(e.into());
        }
    }

    async fn on_services_discovered(&self, result: Result<CharacteristicHandle, DiscoveryFailure>) {
        if self.link.state() != LinkState::ServicesDiscovering {
            debug!("Discovery result in state {}, ignored", self.link.state());
            return;
        }

        let handle = match result {
            Ok(handle) => handle,
            Err(failure) => {
                let error = match failure {
                    DiscoveryFailure::ServiceNotFound => LinkError::ServiceNotFound,
                    DiscoveryFailure::CharacteristicNotFound => LinkError::CharacteristicNotFound,
                    DiscoveryFailure::Status(code) => LinkError::DiscoveryFailed(code),
                };
                self.abandon(error);
                return;
            }
        };

        if let Err(e) = self.transport.enable_notifications(handle).await {
            self.abandon(e.into());
            return;
        }
        if self
            .link
            .apply(LinkInput::CharacteristicFound(handle))
            .is_moved()
        {
            info!("Characteristic found, link ready");
        }
    }

    fn on_notification(&self, handle: CharacteristicHandle, value: &[u8]) {
        if self.link.current_characteristic_handle() != Some(handle) {
            trace!("Notification on unknown handle {:?}, ignored", handle);
            return;
        }
        trace!("Received notification, len = {}", value.len());

        match protocol::decode_notification(value) {
            Ok(notification) => {
                if let Notification::Settings(snapshot) = &notification {
                    lock(&self.modifiers).set_raw_key_codes(snapshot.send_raw_key_codes);
                    *lock(&self.emulator) = Some(snapshot.clone());
                }
                self.router.route(notification);
            }
            Err(e) => warn!("Dropped notification: {}", e),
        }
    }
}

async fn run_event_loop<T: BleTransport>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        shared.handle_event(event).await;
    }
    debug!("Transport event channel closed");
}

async fn run_battery_monitor<T: BleTransport>(shared: Arc<Shared<T>>, schedule: BatterySchedule) {
    let mut status = shared.link.watch();
    loop {
        let ready = status
            .wait_for(|s| s.state == LinkState::Ready)
            .await
            .is_ok();
        if !ready {
            return;
        }

        let mut delay = schedule.first_check;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_until_not_ready(&mut status) => break,
            }
            match shared
                .gate
                .send(Command::GetBatteryVoltage.to_frame(), true)
                .await
            {
                Ok(()) => debug!("Requested battery voltage"),
                Err(e) => debug!("Battery voltage request failed: {}", e),
            }
            delay = schedule.interval;
        }
    }
}
