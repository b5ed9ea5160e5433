//! Per-tick quality stages: dedup, ordering, sanity, throttle.

use crate::config::PipelineConfig;
use fxb_core::{now_ms, Price, SourceTag, Symbol, Tick};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// Why a tick was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Identical successive sample for the same (symbol, source).
    Duplicate,
    /// Older than the age limit or behind the last accepted timestamp.
    Stale,
    /// Crossed quote or implausible jump from the last accepted mid.
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
struct LastSample {
    timestamp_ms: i64,
    bid: Price,
    ask: Price,
}

/// Stateful admission filter, serial per tick.
///
/// Ordering and dedup state is per (symbol, source); sanity and throttle
/// state is per symbol, across sources. The age check is anchored to the
/// wall clock, so it covers the very first tick after a cold start too.
pub struct QuoteFilter {
    config: PipelineConfig,
    last_sample: HashMap<(Symbol, SourceTag), LastSample>,
    last_accepted_mid: HashMap<Symbol, Price>,
    last_broadcast_mid: HashMap<Symbol, Price>,
}

impl QuoteFilter {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            last_sample: HashMap::new(),
            last_accepted_mid: HashMap::new(),
            last_broadcast_mid: HashMap::new(),
        }
    }

    /// Admission decision for a raw tick. Does not touch throttle state.
    pub fn admit(&mut self, tick: &Tick) -> Result<(), DropReason> {
        let key = (tick.symbol.clone(), tick.source.clone());

        if let Some(last) = self.last_sample.get(&key) {
            if last.timestamp_ms == tick.timestamp_ms
                && last.bid == tick.bid
                && last.ask == tick.ask
            {
                return Err(DropReason::Duplicate);
            }
            if tick.timestamp_ms < last.timestamp_ms {
                debug!(symbol = %tick.symbol, source = %tick.source, "non-monotonic tick");
                return Err(DropReason::Stale);
            }
        }

        if now_ms() - tick.timestamp_ms > self.config.max_tick_age_ms {
            return Err(DropReason::Stale);
        }

        if !tick.is_well_formed() {
            return Err(DropReason::Invalid);
        }

        if let Some(&last_mid) = self.last_accepted_mid.get(&tick.symbol) {
            match tick.mid().rel_change_from(last_mid) {
                Some(change) if change > self.config.max_mid_change => {
                    debug!(symbol = %tick.symbol, %change, "mid spike rejected");
                    return Err(DropReason::Invalid);
                }
                _ => {}
            }
        }

        // Accepted: advance dedup/ordering/sanity state.
        self.last_sample.insert(
            key,
            LastSample {
                timestamp_ms: tick.timestamp_ms,
                bid: tick.bid,
                ask: tick.ask,
            },
        );
        self.last_accepted_mid.insert(tick.symbol.clone(), tick.mid());
        Ok(())
    }

    /// Broadcast decision for an accepted tick.
    ///
    /// In full-tick mode every accepted tick is broadcast. Otherwise the
    /// broadcast is suppressed while the mid stays within epsilon of the
    /// last broadcast mid; storage and the engine still see the tick.
    pub fn should_broadcast(&mut self, tick: &Tick) -> bool {
        if self.config.full_tick {
            self.last_broadcast_mid
                .insert(tick.symbol.clone(), tick.mid());
            return true;
        }
        let mid = tick.mid();
        let broadcast = match self.last_broadcast_mid.get(&tick.symbol) {
            None => true,
            Some(&last) => match mid.rel_change_from(last) {
                Some(change) => change >= self.config.throttle_epsilon,
                None => true,
            },
        };
        if broadcast {
            self.last_broadcast_mid.insert(tick.symbol.clone(), mid);
        }
        broadcast
    }

    pub fn epsilon(&self) -> Decimal {
        self.config.throttle_epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(ts: i64, bid: Decimal, ask: Decimal) -> Tick {
        Tick::new("EURUSD", Price::new(bid), Price::new(ask), ts, "LP1")
    }

    fn filter() -> QuoteFilter {
        QuoteFilter::new(PipelineConfig::default())
    }

    #[test]
    fn duplicate_dropped() {
        let mut f = filter();
        let base = now_ms();
        let t = tick(base, dec!(1.0850), dec!(1.0851));
        assert!(f.admit(&t).is_ok());
        assert_eq!(f.admit(&t), Err(DropReason::Duplicate));
        // Same prices, newer timestamp: admitted.
        assert!(f
            .admit(&tick(base + 1000, dec!(1.0850), dec!(1.0851)))
            .is_ok());
    }

    #[test]
    fn non_monotonic_dropped() {
        let mut f = filter();
        let base = now_ms();
        assert!(f.admit(&tick(base, dec!(1.0850), dec!(1.0851))).is_ok());
        assert_eq!(
            f.admit(&tick(base - 1000, dec!(1.0852), dec!(1.0853))),
            Err(DropReason::Stale)
        );
    }

    #[test]
    fn old_tick_dropped() {
        let mut f = filter();
        let base = now_ms();
        // Older than the 60 s age limit, even as the first tick ever seen.
        assert_eq!(
            f.admit(&tick(base - 61_000, dec!(1.0850), dec!(1.0851))),
            Err(DropReason::Stale)
        );
        // A lagging but in-window source is fine.
        let mut lagging = tick(base - 30_000, dec!(1.0850), dec!(1.0851));
        lagging.source = SourceTag::new("LP2");
        assert!(f.admit(&lagging).is_ok());
    }

    #[test]
    fn crossed_and_locked_quotes_dropped() {
        let mut f = filter();
        let base = now_ms();
        assert_eq!(
            f.admit(&tick(base, dec!(1.0852), dec!(1.0851))),
            Err(DropReason::Invalid)
        );
        assert_eq!(
            f.admit(&tick(base + 1, dec!(1.0851), dec!(1.0851))),
            Err(DropReason::Invalid)
        );
    }

    #[test]
    fn spike_dropped() {
        let mut f = filter();
        let base = now_ms();
        assert!(f.admit(&tick(base, dec!(1.0850), dec!(1.0851))).is_ok());
        // +20% jump
        assert_eq!(
            f.admit(&tick(base + 1000, dec!(1.3020), dec!(1.3021))),
            Err(DropReason::Invalid)
        );
        // A 5% move passes.
        assert!(f
            .admit(&tick(base + 2000, dec!(1.1392), dec!(1.1393)))
            .is_ok());
    }

    #[test]
    fn throttle_suppresses_sub_epsilon_moves() {
        let mut f = filter();
        let base = now_ms();
        let first = tick(base, dec!(1.0850), dec!(1.0851));
        f.admit(&first).unwrap();
        assert!(f.should_broadcast(&first));

        // Oscillate by 1e-7, well below epsilon.
        for i in 0..100 {
            let delta = if i % 2 == 0 { dec!(0.0000001) } else { dec!(0) };
            let t = tick(base + 1000 + i, dec!(1.0850) + delta, dec!(1.0851) + delta);
            f.admit(&t).unwrap();
            assert!(!f.should_broadcast(&t));
        }

        // A real move is broadcast.
        let moved = tick(base + 2000, dec!(1.0860), dec!(1.0861));
        f.admit(&moved).unwrap();
        assert!(f.should_broadcast(&moved));
    }

    #[test]
    fn full_tick_mode_broadcasts_everything() {
        let mut f = QuoteFilter::new(PipelineConfig {
            full_tick: true,
            ..PipelineConfig::default()
        });
        let base = now_ms();
        for i in 0..10 {
            let t = tick(base + i, dec!(1.0850), dec!(1.0851) + Decimal::new(i, 7));
            f.admit(&t).unwrap();
            assert!(f.should_broadcast(&t));
        }
    }
}
