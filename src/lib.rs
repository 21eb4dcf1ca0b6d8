//! AMS remote library
//! A Bluetooth LE client for the Apple Media Service: it finds a media
//! source, subscribes to its now-playing updates and sends remote commands.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;
pub mod utils;

pub use commands::ControllerHandle;
pub use config::AppConfig;
pub use error::{ControllerError, SessionError, TransportError};
pub use state::AppState;
