//! Instrument identification and specification.

use crate::decimal::{Price, Volume};
use crate::error::{CoreError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instrument identifier (e.g. "EURUSD", "XAUUSD", "BTCUSD").
///
/// Stored upper-case; the primary map key across the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        let mut s = s.into();
        s.make_ascii_uppercase();
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base currency for a 6-letter forex pair, None otherwise.
    pub fn base_currency(&self) -> Option<&str> {
        if self.0.len() == 6 {
            Some(&self.0[..3])
        } else {
            None
        }
    }

    /// Quote currency for a 6-letter forex pair, None otherwise.
    pub fn quote_currency(&self) -> Option<&str> {
        if self.0.len() == 6 {
            Some(&self.0[3..])
        } else {
            None
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Product class of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductClass {
    Forex,
    Metal,
    Index,
    Crypto,
}

impl fmt::Display for ProductClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forex => write!(f, "forex"),
            Self::Metal => write!(f, "metal"),
            Self::Index => write!(f, "index"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

/// Immutable catalog entry for a tradable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Instrument identifier.
    pub symbol: Symbol,
    /// Quoted decimal digits (5 for EURUSD, 3 for USDJPY, 2 for XAUUSD).
    pub digits: u32,
    /// Pip size; 10^-digits for price-quoted instruments.
    pub pip: Price,
    /// Minimum order volume in lots.
    pub volume_min: Volume,
    /// Maximum order volume in lots.
    pub volume_max: Volume,
    /// Volume increment in lots.
    pub volume_step: Volume,
    /// Units of base currency per lot.
    pub contract_size: Decimal,
    /// Currency positions are settled in before account conversion.
    pub quote_currency: String,
    /// Product class.
    pub product: ProductClass,
    /// Whether quoting and order acceptance are enabled.
    pub enabled: bool,
}

impl SymbolSpec {
    /// Pip size implied by a digit count: 10^-digits.
    pub fn pip_for_digits(digits: u32) -> Price {
        Price::new(Decimal::new(1, digits))
    }

    /// Check the catalog invariant pip == 10^-digits.
    pub fn pip_matches_digits(&self) -> bool {
        self.pip == Self::pip_for_digits(self.digits)
    }

    /// Validate an order volume against min/max/step.
    pub fn validate_volume(&self, volume: Volume) -> Result<()> {
        if !volume.is_positive()
            || volume < self.volume_min
            || volume > self.volume_max
            || !volume.is_multiple_of(self.volume_step)
        {
            return Err(CoreError::VolumeOutOfRange {
                symbol: self.symbol.clone(),
                volume,
            });
        }
        Ok(())
    }
}
