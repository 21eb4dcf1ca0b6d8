//! Bluetooth functionality for the AMS remote
//! This module handles everything between the radio and the decoded
//! now-playing state: scanning, connecting, GATT discovery, subscription,
//! heartbeat and remote command writes.

pub mod constants;
pub mod gatt_queue;
pub mod heartbeat;
pub mod manager;
pub mod mock;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(feature = "bluest")]
pub mod bluest_backend;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_backend::BluestTransport;
pub use constants::*;
pub use manager::{CentralController, ControllerEvent};
pub use mock::{MockTransport, TransportCall};
pub use session::{DeviceSession, SessionState};
pub use transport::{BleTransport, GattEvent, TransportEvent};
pub use types::{
    CharacteristicRole, GattCharacteristic, GattService, PeripheralHandle, PeripheralId,
    RadioState, SessionId, WriteKind,
};
