use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::HEARTBEAT_INTERVAL_SECS;
use crate::core::codec::{AttributeCategory, FrameLayout};

/// Per-session protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Period of the keep-alive write once the session is active, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Categories subscribed to once entity-update notifications are enabled, in write order.
    pub tracked_categories: Vec<AttributeCategory>,
    /// Layout of incoming entity-update frames.
    pub frame_layout: FrameLayout,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            tracked_categories: vec![
                AttributeCategory::Track,
                AttributeCategory::Queue,
                AttributeCategory::Player,
            ],
            frame_layout: FrameLayout::Compact,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
