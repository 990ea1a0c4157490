use std::time::Duration;

use beepcore_frame::DEFAULT_WINDOW_SIZE;
use beepcore_pool::PoolConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration shared by every channel created under one [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound for synchronous waits: replies, start and close answers,
    /// and flushing owed replies before a close completes.
    pub reply_timeout: Duration,
    /// Slice used when blocking waits re-check connection liveness.
    pub close_poll_interval: Duration,
    /// Window advertised from the first SEQ frame on. The initial window is
    /// always 4096 as required by RFC 3081.
    pub desired_window_size: u32,
    /// Deliver frames of each type strictly in numbering order.
    pub serialize: bool,
    /// Join continuation frames before delivery.
    pub complete_frames: bool,
    /// Refuse to start channels for profiles the peer did not advertise.
    pub enforce_profile_support: bool,
    pub pool: PoolConfig,
}

impl ChannelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(60),
            close_poll_interval: Duration::from_millis(500),
            desired_window_size: DEFAULT_WINDOW_SIZE,
            serialize: false,
            complete_frames: true,
            enforce_profile_support: false,
            pool: PoolConfig::default(),
        }
    }
}
