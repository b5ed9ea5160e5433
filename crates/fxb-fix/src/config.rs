//! Gateway and session configuration.

use serde::{Deserialize, Serialize};

/// One upstream FIX session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session name ("lp1-md", "lp1-trade").
    pub name: String,
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Negotiated heartbeat interval, seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Send ResetSeqNumFlag=Y on logon and start both sides at 1.
    #[serde(default)]
    pub reset_seq_on_logon: bool,
    /// Route market-data subscriptions over this session.
    #[serde(default = "default_true")]
    pub market_data: bool,
    /// Route order flow over this session.
    #[serde(default)]
    pub orders: bool,
    /// Reconnect backoff floor, seconds.
    #[serde(default = "default_backoff_floor_secs")]
    pub backoff_floor_secs: u64,
    /// Reconnect backoff cap, seconds.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_backoff_floor_secs() -> u64 {
    1
}

fn default_backoff_cap_secs() -> u64 {
    30
}

/// Instrument routing fields an upstream requires on subscribe requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRouting {
    /// FIX Product code (4 = CURRENCY).
    #[serde(default = "default_product")]
    pub product: u32,
    /// SecurityType (e.g. "FOR").
    #[serde(default = "default_security_type")]
    pub security_type: String,
    #[serde(default = "default_security_exchange")]
    pub security_exchange: String,
}

fn default_product() -> u32 {
    4
}

fn default_security_type() -> String {
    "FOR".to_string()
}

fn default_security_exchange() -> String {
    "XOFF".to_string()
}

impl Default for InstrumentRouting {
    fn default() -> Self {
        Self {
            product: default_product(),
            security_type: default_security_type(),
            security_exchange: default_security_exchange(),
        }
    }
}

/// Gateway-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upstream sessions, typically one for market data and one for orders.
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
    #[serde(default)]
    pub routing: InstrumentRouting,
    /// Capacity of the tick channel toward the pipeline.
    #[serde(default = "default_tick_channel_capacity")]
    pub tick_channel_capacity: usize,
}

fn default_tick_channel_capacity() -> usize {
    4096
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            routing: InstrumentRouting::default(),
            tick_channel_capacity: default_tick_channel_capacity(),
        }
    }
}
