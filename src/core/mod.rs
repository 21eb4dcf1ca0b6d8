//! Core functionality for the AMS remote
//! This module contains the wire codec, the now-playing store and the
//! Bluetooth session machinery built on top of them.

pub mod bluetooth;
pub mod codec;
pub mod track_info;

// Re-export commonly used types
pub use bluetooth::{CentralController, ControllerEvent};
pub use codec::{AttributeCategory, AttributeUpdate, ControlCommand, DecodeError, FrameLayout};
pub use track_info::{TrackSnapshot, TrackStore};
