//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_AMS_ENTITY_ATTRIBUTE, UUID_AMS_ENTITY_UPDATE, UUID_AMS_REMOTE_COMMAND,
};

/// Platform-specific unique identifier of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralHandle {
    /// Stable identity used for connect and disconnect
    pub id: PeripheralId,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// MAC address when the platform exposes one
    pub address: Option<String>,
    /// The signal strength (RSSI) of the last advertisement
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: PeripheralId, name: Option<String>, address: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id,
            name,
            address,
            rssi,
        }
    }

    /// Name for display, falling back to the identifier
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    /// Returns true if the advertised name contains `needle`
    pub fn name_contains(&self, needle: &str) -> bool {
        self.name
            .as_ref()
            .map(|name| name.contains(needle))
            .unwrap_or(false)
    }
}

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattService {
    pub uuid: Uuid,
}

/// A discovered GATT characteristic, identified by its service and its own UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl GattCharacteristic {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

/// Write acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// State reported by the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Generation counter distinguishing successive sessions on one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The three Apple Media Service characteristics a session needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    RemoteCommand,
    EntityUpdate,
    EntityAttribute,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 3] =
        [Self::RemoteCommand, Self::EntityUpdate, Self::EntityAttribute];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::RemoteCommand => UUID_AMS_REMOTE_COMMAND,
            Self::EntityUpdate => UUID_AMS_ENTITY_UPDATE,
            Self::EntityAttribute => UUID_AMS_ENTITY_ATTRIBUTE,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }
}

/// Role bindings resolved during characteristic discovery
#[derive(Debug, Default)]
pub struct CharacteristicMap {
    bindings: HashMap<CharacteristicRole, GattCharacteristic>,
}

impl CharacteristicMap {
    /// Binds `characteristic` to `role`. Returns false if it was already bound to it.
    pub fn bind(&mut self, role: CharacteristicRole, characteristic: GattCharacteristic) -> bool {
        self.bindings.insert(role, characteristic.clone()).as_ref() != Some(&characteristic)
    }

    pub fn get(&self, role: CharacteristicRole) -> Option<&GattCharacteristic> {
        self.bindings.get(&role)
    }

    pub fn role_of(&self, characteristic: &GattCharacteristic) -> Option<CharacteristicRole> {
        self.bindings
            .iter()
            .find(|(_, bound)| *bound == characteristic)
            .map(|(role, _)| *role)
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn all_bound(&self) -> bool {
        CharacteristicRole::ALL
            .iter()
            .all(|role| self.bindings.contains_key(role))
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}
