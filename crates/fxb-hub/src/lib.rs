//! WebSocket fan-out hub.
//!
//! Accepts authenticated clients, tracks per-client subscriptions, and
//! broadcasts ticks and trading events. Each client has one bounded
//! outbound queue; a send that would block is dropped and counted, and a
//! client that keeps falling behind is closed. The broadcaster itself
//! never blocks.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod server;

pub use auth::{Identity, TokenValidator};
pub use client::{ClientHandle, CloseIntent};
pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use server::{router, run_server};
