//! Time-bucketed OHLC aggregation types.

use crate::decimal::Price;
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregation timeframe.
///
/// Buckets align on whole multiples of the timeframe from the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Bucket width in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Bucket start for a timestamp: floor(ts / width) * width.
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        let w = self.duration_ms();
        timestamp_ms.div_euclid(w) * w
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::M1 => write!(f, "1m"),
            Self::M5 => write!(f, "5m"),
            Self::M15 => write!(f, "15m"),
            Self::H1 => write!(f, "1h"),
            Self::H4 => write!(f, "4h"),
            Self::D1 => write!(f, "1d"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// One candlestick over a timeframe bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Bucket start, milliseconds since the Unix epoch.
    pub bucket_start_ms: i64,
    /// Mid-price of the first tick in the bucket.
    pub open: Price,
    pub high: Price,
    pub low: Price,
    /// Mid-price of the most recent tick in the bucket.
    pub close: Price,
    /// Number of ticks aggregated.
    pub volume: u64,
}

impl OhlcBar {
    /// Open a new bar from the first mid-price in a bucket.
    pub fn open_bucket(
        symbol: Symbol,
        timeframe: Timeframe,
        bucket_start_ms: i64,
        mid: Price,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            bucket_start_ms,
            open: mid,
            high: mid,
            low: mid,
            close: mid,
            volume: 1,
        }
    }

    /// Fold another mid-price from the same bucket into the bar.
    pub fn update(&mut self, mid: Price) {
        if mid > self.high {
            self.high = mid;
        }
        if mid < self.low {
            self.low = mid;
        }
        self.close = mid;
        self.volume += 1;
    }

    /// Invariant check: low <= {open, close} <= high.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bucket_alignment() {
        let tf = Timeframe::M1;
        assert_eq!(tf.bucket_start(1_705_778_115_000), 1_705_778_100_000);
        assert_eq!(tf.bucket_start(1_705_778_100_000), 1_705_778_100_000);
        assert_eq!(tf.bucket_start(1_705_778_159_999), 1_705_778_100_000);
        assert_eq!(tf.bucket_start(1_705_778_160_000), 1_705_778_160_000);
        // Multiples of the timeframe from the epoch
        assert_eq!(tf.bucket_start(59_999), 0);
        assert_eq!(Timeframe::D1.bucket_start(86_400_001), 86_400_000);
    }

    #[test]
    fn bar_update() {
        let mut bar = OhlcBar::open_bucket(
            Symbol::new("EURUSD"),
            Timeframe::M1,
            1_705_778_100_000,
            Price::new(dec!(1.08505)),
        );
        bar.update(Price::new(dec!(1.08525)));
        bar.update(Price::new(dec!(1.08495)));

        assert_eq!(bar.open.inner(), dec!(1.08505));
        assert_eq!(bar.high.inner(), dec!(1.08525));
        assert_eq!(bar.low.inner(), dec!(1.08495));
        assert_eq!(bar.close.inner(), dec!(1.08495));
        assert_eq!(bar.volume, 3);
        assert!(bar.is_consistent());
    }

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.to_string().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("2m".parse::<Timeframe>().is_err());
    }
}
