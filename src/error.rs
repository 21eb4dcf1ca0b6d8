//! Error types shared by the transport, session and controller layers.

use thiserror::Error;

use crate::core::bluetooth::types::{PeripheralId, RadioState};

/// Radio or link level failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("peripheral {0} is not known to the transport")]
    PeripheralNotFound(PeripheralId),
    #[error("service {0} has not been discovered")]
    ServiceNotFound(uuid::Uuid),
    #[error("characteristic {0} has not been discovered")]
    CharacteristicNotFound(uuid::Uuid),
    #[error("request queue for this peripheral is closed")]
    QueueClosed,
    #[error("request queue for this peripheral is full")]
    QueueFull,
    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "bluest")]
impl From<bluest::Error> for TransportError {
    fn from(err: bluest::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Failures of a single device session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("media service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("entity update subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("session is not ready for commands")]
    NotReady,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Whether the session was torn down by this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotReady)
    }
}

/// Errors surfaced through the controller handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("bluetooth radio is not ready ({0:?})")]
    RadioNotReady(RadioState),
    #[error("peripheral {0} has not been discovered")]
    UnknownPeripheral(PeripheralId),
    #[error("peripheral {0} has no active session")]
    NotConnected(PeripheralId),
    #[error("peripheral {0} is still disconnecting")]
    Disconnecting(PeripheralId),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("controller has stopped")]
    Stopped,
}
