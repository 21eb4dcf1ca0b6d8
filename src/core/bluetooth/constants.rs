//! Constants used throughout the application
//! This module contains the Apple Media Service UUIDs and the timing defaults
//! used by the session and controller layers.

use uuid::Uuid;

/// The UUID of the Apple Media Service
pub const UUID_AMS_SERVICE: Uuid = Uuid::from_u128(0x89d3502b_0f36_433a_8ef4_c502ad55f8dc);

/// Remote Command characteristic (write commands, notifies supported commands)
pub const UUID_AMS_REMOTE_COMMAND: Uuid = Uuid::from_u128(0x9b3c81d8_57b1_4a8a_b8df_0e56f7ca51c2);

/// Entity Update characteristic (subscription writes, attribute notifications)
pub const UUID_AMS_ENTITY_UPDATE: Uuid = Uuid::from_u128(0x2f7cabce_808d_411f_9a0c_bb92ba96c102);

/// Entity Attribute characteristic (write-only from this side; carries the heartbeat)
pub const UUID_AMS_ENTITY_ATTRIBUTE: Uuid =
    Uuid::from_u128(0xc6b2f38c_23ab_46d8_a6ab_a3a870bbd5d7);

/// Heartbeat period while a session is active
pub const HEARTBEAT_INTERVAL_SECS: u64 = 3;

/// Maximum number of connection attempts
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Time allowed from connect to an active session
pub const SESSION_SETUP_TIMEOUT_SECS: u64 = 10;

/// Capacity of the controller event broadcast
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the controller request channel
pub const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Requests a peripheral's GATT queue holds before rejecting more
pub const GATT_QUEUE_CAPACITY: usize = 16;
