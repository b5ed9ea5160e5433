//! The closed set of events broadcast to WebSocket clients, and the
//! inbound requests clients may send.
//!
//! Every server-to-client message carries a `type` tag and a `timestamp`
//! in epoch milliseconds; serialization goes through this single enum so
//! there is exactly one dispatch point to JSON.

use crate::account::{Account, AccountId, AccountStatus};
use crate::decimal::Price;
use crate::order::Order;
use crate::position::{CloseReason, Position};
use crate::symbol::Symbol;
use crate::tick::{SourceTag, Tick};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Margin-call escalation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarginCallAction {
    Warning,
    StopOut,
}

/// Account fields published with `account_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub login: AccountId,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<Decimal>,
    pub status: AccountStatus,
}

impl From<&Account> for AccountUpdate {
    fn from(acc: &Account) -> Self {
        Self {
            login: acc.id,
            balance: acc.balance,
            equity: acc.equity,
            margin: acc.margin_used,
            free_margin: acc.free_margin(),
            margin_level: acc.margin_level(),
            status: acc.status,
        }
    }
}

/// Server-to-client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Tick {
        symbol: Symbol,
        bid: Price,
        ask: Price,
        spread: Price,
        timestamp: i64,
        source: SourceTag,
    },
    OrderNew {
        order: Order,
        timestamp: i64,
    },
    OrderModify {
        order: Order,
        timestamp: i64,
    },
    OrderClose {
        order: Order,
        timestamp: i64,
    },
    PositionOpened {
        position: Position,
        timestamp: i64,
    },
    PositionModified {
        position: Position,
        timestamp: i64,
    },
    PositionClosed {
        position: Position,
        close_price: Price,
        realized_pl: Decimal,
        reason: CloseReason,
        timestamp: i64,
    },
    AccountUpdate {
        #[serde(flatten)]
        account: AccountUpdate,
        timestamp: i64,
    },
    MarginCall {
        login: AccountId,
        margin_level: Decimal,
        equity: Decimal,
        margin: Decimal,
        action: MarginCallAction,
        timestamp: i64,
    },
    Heartbeat {
        timestamp: i64,
    },
    Subscribed {
        symbols: Vec<Symbol>,
        timestamp: i64,
    },
    Unsubscribed {
        symbols: Vec<Symbol>,
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        timestamp: i64,
    },
}

impl StreamEvent {
    /// Build the tick event from an accepted pipeline tick.
    pub fn from_tick(tick: &Tick) -> Self {
        Self::Tick {
            symbol: tick.symbol.clone(),
            bid: tick.bid,
            ask: tick.ask,
            spread: tick.spread(),
            timestamp: tick.timestamp_ms,
            source: tick.source.clone(),
        }
    }

    /// Symbol this event concerns, None for account-scoped and session events.
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Tick { symbol, .. } => Some(symbol),
            Self::OrderNew { order, .. }
            | Self::OrderModify { order, .. }
            | Self::OrderClose { order, .. } => Some(&order.symbol),
            Self::PositionOpened { position, .. }
            | Self::PositionModified { position, .. }
            | Self::PositionClosed { position, .. } => Some(&position.symbol),
            _ => None,
        }
    }

    /// Account this event concerns, None for market data and session events.
    pub fn account(&self) -> Option<AccountId> {
        match self {
            Self::OrderNew { order, .. }
            | Self::OrderModify { order, .. }
            | Self::OrderClose { order, .. } => Some(order.account),
            Self::PositionOpened { position, .. }
            | Self::PositionModified { position, .. }
            | Self::PositionClosed { position, .. } => Some(position.account),
            Self::AccountUpdate { account, .. } => Some(account.login),
            Self::MarginCall { login, .. } => Some(*login),
            _ => None,
        }
    }
}

/// Client-to-server request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe { symbols: Vec<Symbol> },
    Unsubscribe { symbols: Vec<Symbol> },
    Snapshot { symbols: Vec<Symbol> },
    Pong,
}
