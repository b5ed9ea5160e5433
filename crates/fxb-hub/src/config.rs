//! Hub configuration.

use fxb_core::AccountId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// WebSocket hub tuning and static credentials.
///
/// Token issuance is an external concern; the hub only validates the
/// tokens it is handed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Listen address for the HTTP/WebSocket server.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-client outbound queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Drops within the window that close a slow client.
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: u64,
    /// Drop-counting window, seconds.
    #[serde(default = "default_drop_window_secs")]
    pub drop_window_secs: u64,
    /// Server heartbeat cadence, seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Close a client after this long without inbound traffic, seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Trader tokens: token -> account login.
    #[serde(default)]
    pub trader_tokens: HashMap<String, AccountId>,
    /// Admin tokens, granted the aggregated firehose channels.
    #[serde(default)]
    pub admin_tokens: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_drop_threshold() -> u64 {
    256
}

fn default_drop_window_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_capacity: default_queue_capacity(),
            drop_threshold: default_drop_threshold(),
            drop_window_secs: default_drop_window_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            trader_tokens: HashMap::new(),
            admin_tokens: Vec::new(),
        }
    }
}
