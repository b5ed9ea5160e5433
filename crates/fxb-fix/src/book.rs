//! Cached top-of-book per symbol.
//!
//! Snapshots replace a side; incremental refreshes patch only the sides
//! present in the message, everything else retains its prior value. A
//! complete (bid and ask) book after an update yields a normalized tick.

use crate::messages::{MarketDataUpdate, MdSide};
use dashmap::DashMap;
use fxb_core::{now_ms, Price, SourceTag, Symbol, Tick};

#[derive(Debug, Default, Clone, Copy)]
struct TopOfBook {
    bid: Option<Price>,
    ask: Option<Price>,
}

/// Top-of-book cache for every subscribed symbol.
#[derive(Default)]
pub struct QuoteBook {
    books: DashMap<Symbol, TopOfBook>,
}

impl QuoteBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a parsed snapshot or incremental refresh.
    ///
    /// Returns one tick per symbol whose book changed and is complete after
    /// the update, stamped with the receive time and the given source.
    pub fn apply(&self, update: &MarketDataUpdate, source: &SourceTag) -> Vec<Tick> {
        let mut touched: Vec<Symbol> = Vec::new();

        for entry in &update.entries {
            let Some(symbol) = entry
                .symbol
                .as_deref()
                .or(update.symbol.as_deref())
                .map(Symbol::new)
            else {
                continue;
            };

            let mut book = self.books.entry(symbol.clone()).or_default();
            let changed = if entry.deleted {
                match entry.side {
                    MdSide::Bid => book.bid.take().is_some(),
                    MdSide::Offer => book.ask.take().is_some(),
                }
            } else {
                match (entry.side, entry.price) {
                    (MdSide::Bid, Some(px)) => {
                        let changed = book.bid != Some(px);
                        book.bid = Some(px);
                        changed
                    }
                    (MdSide::Offer, Some(px)) => {
                        let changed = book.ask != Some(px);
                        book.ask = Some(px);
                        changed
                    }
                    // Price absent on a non-delete: side retains prior value.
                    _ => false,
                }
            };
            drop(book);

            if changed && !touched.contains(&symbol) {
                touched.push(symbol);
            }
        }

        let ts = now_ms();
        touched
            .into_iter()
            .filter_map(|symbol| {
                let book = self.books.get(&symbol)?;
                match (book.bid, book.ask) {
                    (Some(bid), Some(ask)) => Some(Tick {
                        symbol: symbol.clone(),
                        bid,
                        ask,
                        timestamp_ms: ts,
                        source: source.clone(),
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Current cached top-of-book, if complete.
    pub fn top(&self, symbol: &Symbol) -> Option<(Price, Price)> {
        let book = self.books.get(symbol)?;
        match (book.bid, book.ask) {
            (Some(bid), Some(ask)) => Some((bid, ask)),
            _ => None,
        }
    }

    /// Forget a symbol (unsubscribe).
    pub fn remove(&self, symbol: &Symbol) {
        self.books.remove(symbol);
    }
}
