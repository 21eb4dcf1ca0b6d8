//! In-memory transport
//! Records every request it receives and lets a caller inject the unsolicited
//! events a real radio would produce. Used by the test suites and usable by a
//! presentation layer running without hardware.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::UUID_AMS_SERVICE;
use crate::core::bluetooth::transport::{BleTransport, TransportEvent};
use crate::core::bluetooth::types::{
    CharacteristicRole, GattCharacteristic, GattService, PeripheralHandle, PeripheralId,
    RadioState, WriteKind,
};
use crate::error::TransportError;

/// A request observed by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    StartScan {
        allow_duplicates: bool,
    },
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices {
        peripheral: PeripheralId,
        service: Uuid,
    },
    DiscoverCharacteristics {
        peripheral: PeripheralId,
        service: Uuid,
    },
    SetNotify {
        peripheral: PeripheralId,
        characteristic: GattCharacteristic,
        enabled: bool,
    },
    Write {
        peripheral: PeripheralId,
        characteristic: GattCharacteristic,
        value: Vec<u8>,
        kind: WriteKind,
    },
}

#[derive(Default)]
struct Script {
    services: Vec<GattService>,
    characteristics: HashMap<Uuid, Vec<GattCharacteristic>>,
    fail_service_discovery: bool,
    failing_notify: HashSet<Uuid>,
    failing_connects: u32,
    disconnect_delay: Option<Duration>,
    stalled_writes: HashSet<Uuid>,
}

pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Mutex<Vec<TransportCall>>,
    script: Mutex<Script>,
}

impl MockTransport {
    /// A transport whose peripherals expose nothing.
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
        }
    }

    /// A transport whose peripherals expose the media service with all three characteristics.
    pub fn with_media_service(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let transport = Self::new(events);
        transport.set_services(vec![GattService {
            uuid: UUID_AMS_SERVICE,
        }]);
        transport.set_characteristics(
            UUID_AMS_SERVICE,
            CharacteristicRole::ALL
                .iter()
                .map(|role| GattCharacteristic::new(UUID_AMS_SERVICE, role.uuid()))
                .collect(),
        );
        transport
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        self.script().services = services;
    }

    pub fn set_characteristics(&self, service: Uuid, characteristics: Vec<GattCharacteristic>) {
        self.script().characteristics.insert(service, characteristics);
    }

    pub fn fail_service_discovery(&self) {
        self.script().fail_service_discovery = true;
    }

    /// Makes enabling notifications on `characteristic` fail.
    pub fn fail_notify(&self, characteristic: Uuid) {
        self.script().failing_notify.insert(characteristic);
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.script().failing_connects = count;
    }

    /// Makes every disconnect take `delay` before it completes.
    pub fn delay_disconnects(&self, delay: Duration) {
        self.script().disconnect_delay = Some(delay);
    }

    /// Writes to `characteristic` are recorded but never complete.
    pub fn stall_writes(&self, characteristic: Uuid) {
        self.script().stalled_writes.insert(characteristic);
    }

    /// Every request received so far, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock_calls().clone()
    }

    /// Values written to the characteristic with `uuid`, oldest first.
    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write {
                    characteristic,
                    value,
                    ..
                } if characteristic.uuid == uuid => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_radio_state(&self, state: RadioState) {
        self.emit(TransportEvent::RadioStateChanged(state));
    }

    pub fn advertise(&self, peripheral: PeripheralHandle) {
        self.emit(TransportEvent::Discovered(peripheral));
    }

    /// Delivers a notification as if the peripheral had pushed it.
    pub fn notify(&self, peripheral: &PeripheralId, characteristic: GattCharacteristic, value: &[u8]) {
        self.emit(TransportEvent::NotificationValue {
            peripheral: peripheral.clone(),
            characteristic,
            value: value.to_vec(),
        });
    }

    /// Reports a link loss the central did not ask for.
    pub fn drop_link(&self, peripheral: &PeripheralId) {
        self.emit(TransportEvent::Disconnected {
            peripheral: peripheral.clone(),
            error: Some(TransportError::Backend("link lost".into())),
        });
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Mock transport event dropped, receiver closed");
        }
    }

    fn record(&self, call: TransportCall) {
        self.lock_calls().push(call);
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<TransportCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self, allow_duplicates: bool) -> Result<(), TransportError> {
        self.record(TransportCall::StartScan { allow_duplicates });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.record(TransportCall::Connect(peripheral.clone()));
        let mut script = self.script();
        if script.failing_connects > 0 {
            script.failing_connects -= 1;
            return Err(TransportError::Backend("connection refused".into()));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect(peripheral.clone()));
        let delay = self.script().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<GattService>, TransportError> {
        self.record(TransportCall::DiscoverServices {
            peripheral: peripheral.clone(),
            service,
        });
        let script = self.script();
        if script.fail_service_discovery {
            return Err(TransportError::Backend("service discovery failed".into()));
        }
        Ok(script.services.clone())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, TransportError> {
        self.record(TransportCall::DiscoverCharacteristics {
            peripheral: peripheral.clone(),
            service: service.uuid,
        });
        self.script()
            .characteristics
            .get(&service.uuid)
            .cloned()
            .ok_or(TransportError::ServiceNotFound(service.uuid))
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetNotify {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            enabled,
        });
        if enabled && self.script().failing_notify.contains(&characteristic.uuid) {
            return Err(TransportError::Backend("notify not permitted".into()));
        }
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Write {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            value: value.to_vec(),
            kind,
        });
        let stalled = self.script().stalled_writes.contains(&characteristic.uuid);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
