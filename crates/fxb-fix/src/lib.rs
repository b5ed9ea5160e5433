//! FIX 4.4 liquidity-provider gateway.
//!
//! The gateway is an initiator: it maintains long-lived sessions to one or
//! more upstream liquidity providers, translates between the internal
//! tick/order model and on-wire FIX messages, and recovers from socket
//! errors, heartbeat timeouts and sequence gaps without losing outstanding
//! orders.
//!
//! Layering, bottom up:
//! - `codec`: SOH framing, BodyLength/CheckSum, incremental frame decoding
//! - `fields`: the tag dictionary
//! - `messages`: typed builders and parsed views over raw tag-value frames
//! - `transport`: the connector seam (TCP in production, duplex in tests)
//! - `session`: per-upstream state machine with logon, heartbeat, resend
//! - `gateway`: session ownership, market-data book, quote/order plumbing

pub mod book;
pub mod codec;
pub mod config;
pub mod error;
pub mod fields;
pub mod gateway;
pub mod messages;
pub mod session;
pub mod transport;

pub use book::QuoteBook;
pub use codec::{encode_message, FrameDecoder, RawMessage};
pub use config::{GatewayConfig, SessionConfig};
pub use error::{FixError, FixResult};
pub use gateway::{FixGateway, GatewayHandle, LpExecution, LpOrder};
pub use session::{FixSession, SessionEvent, SessionHandle, SessionState};
pub use transport::{Connector, DuplexConnector, TcpConnector};
