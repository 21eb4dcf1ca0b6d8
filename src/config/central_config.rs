use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    CONNECT_RETRY_DELAY_MS, MAX_CONNECT_RETRIES, SESSION_SETUP_TIMEOUT_SECS,
};
use crate::core::bluetooth::types::PeripheralHandle;

/// Scan and connection settings for the central controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Report every advertisement so RSSI stays fresh for devices already seen.
    pub allow_duplicates: bool,
    /// Start scanning as soon as the radio reports it is powered on.
    pub auto_scan: bool,
    /// Only report devices whose advertised name contains this text.
    pub name_filter: Option<String>,
    /// Ignore advertisements weaker than this RSSI.
    pub min_rssi: Option<i16>,
    /// Connection attempts before `ConnectFailed` is reported.
    pub max_connect_retries: u32,
    /// Delay between connection attempts, in milliseconds.
    pub connect_retry_delay_ms: u64,
    /// Time allowed for discovery and subscription before the session is failed.
    /// `None` waits indefinitely.
    pub setup_timeout_secs: Option<u64>,
    /// Name the headless runner connects to automatically once discovered.
    pub target_name: Option<String>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            allow_duplicates: true,
            auto_scan: true,
            name_filter: None,
            min_rssi: None,
            max_connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            setup_timeout_secs: Some(SESSION_SETUP_TIMEOUT_SECS),
            target_name: None,
        }
    }
}

impl CentralConfig {
    /// Returns true if an advertisement from `peripheral` passes the name and RSSI filters.
    pub fn accepts(&self, peripheral: &PeripheralHandle) -> bool {
        if let Some(filter) = &self.name_filter {
            if !peripheral.name_contains(filter) {
                return false;
            }
        }
        match (self.min_rssi, peripheral.rssi) {
            (Some(min), Some(rssi)) => rssi >= min,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn setup_timeout(&self) -> Option<Duration> {
        self.setup_timeout_secs.map(Duration::from_secs)
    }
}
