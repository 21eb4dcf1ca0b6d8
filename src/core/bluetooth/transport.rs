//! Transport boundary
//! The platform Bluetooth stack is reached through [`BleTransport`]. Requests
//! are issued by the controller and the per-peripheral request queue; every
//! completion or unsolicited callback comes back as a [`TransportEvent`] on the
//! controller's single event stream.

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::bluetooth::types::{
    GattCharacteristic, GattService, PeripheralHandle, PeripheralId, RadioState, SessionId,
    WriteKind,
};
use crate::error::TransportError;

/// BLE central capability provided by the platform
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Starts continuous discovery. Results arrive as [`TransportEvent::Discovered`].
    async fn start_scan(&self, allow_duplicates: bool) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Discovers the services of `peripheral` matching `service`.
    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<GattService>, TransportError>;

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, TransportError>;

    /// Enables or disables notifications. Values arrive as [`TransportEvent::NotificationValue`].
    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<(), TransportError>;

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &GattCharacteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;
}

/// Completion of a request issued through a peripheral's request queue
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ServicesDiscovered(Result<Vec<GattService>, TransportError>),
    CharacteristicsDiscovered {
        service: GattService,
        result: Result<Vec<GattCharacteristic>, TransportError>,
    },
    NotificationStateChanged {
        characteristic: GattCharacteristic,
        result: Result<(), TransportError>,
    },
    WriteCompleted {
        characteristic: GattCharacteristic,
        result: Result<(), TransportError>,
    },
}

/// Everything the controller reacts to, delivered in order on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    RadioStateChanged(RadioState),
    Discovered(PeripheralHandle),
    ScanStopped(Option<TransportError>),
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        error: TransportError,
    },
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    Gatt {
        peripheral: PeripheralId,
        session: SessionId,
        event: GattEvent,
    },
    NotificationValue {
        peripheral: PeripheralId,
        characteristic: GattCharacteristic,
        value: Vec<u8>,
    },
}
