//! Normalized top-of-book quote.

use crate::decimal::Price;
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the liquidity provider a quote came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTag(String);

impl SourceTag {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Normalized top-of-book quote.
///
/// Admission invariants (bid > 0, ask > bid, non-decreasing timestamp per
/// (symbol, source)) are enforced by the pipeline, not the constructor:
/// raw gateway output may violate them and must still be representable
/// so it can be counted and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub source: SourceTag,
}

impl Tick {
    pub fn new(
        symbol: impl Into<Symbol>,
        bid: Price,
        ask: Price,
        timestamp_ms: i64,
        source: impl Into<SourceTag>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bid,
            ask,
            timestamp_ms,
            source: source.into(),
        }
    }

    /// Spread: ask - bid.
    #[inline]
    pub fn spread(&self) -> Price {
        self.ask - self.bid
    }

    /// Mid-price: (bid + ask) / 2.
    #[inline]
    pub fn mid(&self) -> Price {
        Price::mid(self.bid, self.ask)
    }

    /// Well-formed quote: positive bid, ask strictly above bid.
    /// A locked quote (ask == bid) is as unusable as a crossed one.
    #[inline]
    pub fn is_well_formed(&self) -> bool {
        self.bid.is_positive() && self.ask > self.bid
    }
}
