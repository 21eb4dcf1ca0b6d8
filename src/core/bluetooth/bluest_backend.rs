//! Bluetooth transport over the platform stack
//! This module adapts `bluest` to [`BleTransport`]: scanning, connection
//! watching and notification streams run as cancellable tasks that post
//! [`TransportEvent`]s to the controller.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::transport::{BleTransport, TransportEvent};
use crate::core::bluetooth::types::{
    GattCharacteristic, GattService, PeripheralHandle, PeripheralId, RadioState, WriteKind,
};
use crate::error::TransportError;

type CharacteristicKey = (PeripheralId, GattCharacteristic);

pub struct BluestTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Devices reported by the scanner, by identifier
    devices: Arc<Mutex<HashMap<PeripheralId, Device>>>,
    services: Mutex<HashMap<(PeripheralId, Uuid), Service>>,
    characteristics: Mutex<HashMap<CharacteristicKey, Characteristic>>,
    scan_token: Mutex<Option<CancellationToken>>,
    notify_tokens: Mutex<HashMap<CharacteristicKey, CancellationToken>>,
    link_tokens: Mutex<HashMap<PeripheralId, CancellationToken>>,
    /// Parent of every task token; cancelled on drop
    root_token: CancellationToken,
}

impl BluestTransport {
    /// Opens the default adapter and starts reporting its availability.
    pub async fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        info!("Bluetooth adapter found.");

        let transport = Self {
            adapter,
            events,
            devices: Arc::new(Mutex::new(HashMap::new())),
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
            scan_token: Mutex::new(None),
            notify_tokens: Mutex::new(HashMap::new()),
            link_tokens: Mutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
        };
        transport.watch_adapter();
        Ok(transport)
    }

    fn watch_adapter(&self) {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let cancel_token = self.root_token.child_token();

        tokio::spawn(async move {
            let initial = match adapter.is_available().await {
                Ok(true) => RadioState::PoweredOn,
                Ok(false) => RadioState::PoweredOff,
                Err(e) => {
                    error!("Failed to query adapter state: {}", e);
                    RadioState::Unknown
                }
            };
            let _ = events.send(TransportEvent::RadioStateChanged(initial));

            let stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Adapter state changes unavailable: {}", e);
                    return;
                }
            };
            let mut stream = pin!(stream);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    event = stream.next() => {
                        let state = match event {
                            Some(Ok(AdapterEvent::Available)) => RadioState::PoweredOn,
                            Some(Ok(AdapterEvent::Unavailable)) => RadioState::PoweredOff,
                            Some(Err(e)) => {
                                error!("Error in adapter event stream: {}", e);
                                continue;
                            }
                            None => break,
                        };
                        if events.send(TransportEvent::RadioStateChanged(state)).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Adapter watcher stopped");
        });
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device, TransportError> {
        lock(&self.devices)
            .get(peripheral)
            .cloned()
            .ok_or_else(|| TransportError::PeripheralNotFound(peripheral.clone()))
    }

    fn characteristic(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic, TransportError> {
        lock(&self.characteristics)
            .get(&(peripheral.clone(), characteristic.clone()))
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic.uuid))
    }

    /// Reports a disconnect the central did not request.
    fn watch_link(&self, peripheral: PeripheralId, device: Device) {
        let cancel_token = self.root_token.child_token();
        if let Some(previous) = lock(&self.link_tokens).insert(peripheral.clone(), cancel_token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let stream = match adapter.device_connection_events(&device).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Connection events unavailable for {}: {}", peripheral, e);
                    return;
                }
            };
            let mut stream = pin!(stream);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    event = stream.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            info!("Device {} dropped the connection", peripheral);
                            let _ = events.send(TransportEvent::Disconnected {
                                peripheral: peripheral.clone(),
                                error: Some(TransportError::Backend("connection lost".into())),
                            });
                            break;
                        }
                        Some(ConnectionEvent::Connected) => {}
                        None => break,
                    }
                }
            }
        });
    }

    fn forget(&self, peripheral: &PeripheralId) {
        if let Some(token) = lock(&self.link_tokens).remove(peripheral) {
            token.cancel();
        }
        lock(&self.notify_tokens).retain(|(owner, _), token| {
            if owner == peripheral {
                token.cancel();
                false
            } else {
                true
            }
        });
        lock(&self.characteristics).retain(|(owner, _), _| owner != peripheral);
        lock(&self.services).retain(|(owner, _), _| owner != peripheral);
    }

    /// Pulls a MAC address out of a platform device identifier, if it carries one.
    fn extract_mac_address(device_id: &str) -> Option<String> {
        let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
        re.find_iter(device_id)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.root_token.cancel();
    }
}

#[async_trait]
impl BleTransport for BluestTransport {
    async fn start_scan(&self, allow_duplicates: bool) -> Result<(), TransportError> {
        let cancel_token = self.root_token.child_token();
        if let Some(previous) = lock(&self.scan_token).replace(cancel_token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let devices = self.devices.clone();

        tokio::spawn(async move {
            info!("Starting bluetooth scan");
            let stream = match adapter.scan(&[]).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    let _ = events.send(TransportEvent::ScanStopped(Some(e.into())));
                    return;
                }
            };
            let mut stream = pin!(stream);
            let mut seen = HashSet::new();

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = stream.next() => match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            let id = PeripheralId::new(device.id().to_string());
                            if !seen.insert(id.clone()) && !allow_duplicates {
                                continue;
                            }
                            debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered.rssi);

                            let name = discovered
                                .adv_data
                                .local_name
                                .or_else(|| device.name().ok());
                            let address = Self::extract_mac_address(id.as_str());
                            let handle = PeripheralHandle::new(id.clone(), name, address, discovered.rssi);
                            // resolvable by id before the controller can ask to connect
                            lock(&devices).insert(id, device);
                            if events.send(TransportEvent::Discovered(handle)).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            let _ = events.send(TransportEvent::ScanStopped(None));
                            break;
                        }
                    }
                }
            }
            info!("Device scan task stopped.");
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(token) = lock(&self.scan_token).take() {
            info!("Stopping Bluetooth scan.");
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", peripheral);
            self.adapter.connect_device(&device).await?;
        }
        info!("Connection to {} successful", peripheral);
        self.watch_link(peripheral.clone(), device);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        self.forget(peripheral);
        if device.is_connected().await {
            info!("Disconnecting from device {}", peripheral);
            self.adapter.disconnect_device(&device).await?;
        } else {
            info!("Device {} not connected", peripheral);
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<GattService>, TransportError> {
        let device = self.device(peripheral)?;
        let services = device.discover_services_with_uuid(service).await?;

        let mut cache = lock(&self.services);
        Ok(services
            .into_iter()
            .map(|found| {
                let uuid = found.uuid();
                info!("Found service: {}", uuid);
                cache.insert((peripheral.clone(), uuid), found);
                GattService { uuid }
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, TransportError> {
        let found = lock(&self.services)
            .get(&(peripheral.clone(), service.uuid))
            .cloned()
            .ok_or(TransportError::ServiceNotFound(service.uuid))?;
        let characteristics = found.discover_characteristics().await?;

        let mut cache = lock(&self.characteristics);
        Ok(characteristics
            .into_iter()
            .map(|characteristic| {
                let handle = GattCharacteristic::new(service.uuid, characteristic.uuid());
                debug!("Found characteristic: {}", handle.uuid);
                cache.insert((peripheral.clone(), handle.clone()), characteristic);
                handle
            })
            .collect())
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let key = (peripheral.clone(), characteristic.clone());
        if let Some(token) = lock(&self.notify_tokens).remove(&key) {
            token.cancel();
        }
        if !enabled {
            return Ok(());
        }

        let target = self.characteristic(peripheral, characteristic)?;
        let cancel_token = self.root_token.child_token();
        lock(&self.notify_tokens).insert(key, cancel_token.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        let events = self.events.clone();
        let peripheral = peripheral.clone();
        let handle = characteristic.clone();

        tokio::spawn(async move {
            let stream = match target.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    let _ = ready_tx.send(Err(TransportError::from(e)));
                    return;
                }
            };
            let mut stream = pin!(stream);
            info!("Listening for notifications on {}", handle.uuid);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = stream.next() => match result {
                        Some(Ok(value)) => {
                            let event = TransportEvent::NotificationValue {
                                peripheral: peripheral.clone(),
                                characteristic: handle.clone(),
                                value,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            info!("Notification stream for {} ended", handle.uuid);
        });

        ready_rx
            .await
            .unwrap_or_else(|_| Err(TransportError::Backend("notification task ended".into())))
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(peripheral, characteristic)?;
        match kind {
            WriteKind::WithResponse => target.write(value).await?,
            WriteKind::WithoutResponse => target.write_without_response(value).await?,
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
