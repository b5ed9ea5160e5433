//! Per-account state owned by the engine.

use crate::margin::{convert, required_margin};
use dashmap::DashMap;
use fxb_core::{
    now_ms, Account, LedgerEntry, LedgerEntryKind, Order, OrderId, OrderSide, Position,
    PositionId, Symbol, SymbolSpec, Tick,
};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Everything the engine tracks for one account, guarded by one lock.
#[derive(Debug)]
pub struct AccountBook {
    pub account: Account,
    /// Open positions by id.
    pub positions: HashMap<PositionId, Position>,
    /// Pending (limit/stop/stop-limit) orders by id.
    pub pending: HashMap<OrderId, Order>,
    /// Append-only monetary history.
    pub ledger: Vec<LedgerEntry>,
    /// Edge-trigger latch for the margin-call warning.
    pub margin_call_latched: bool,
    /// Terminal snapshot of the most recently closed position.
    pub last_closed: Option<Position>,
}

impl AccountBook {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            positions: HashMap::new(),
            pending: HashMap::new(),
            ledger: Vec::new(),
            margin_call_latched: false,
            last_closed: None,
        }
    }

    /// Apply a monetary effect: mutate the balance and append the entry
    /// carrying the resulting snapshot.
    pub fn post_ledger(
        &mut self,
        kind: LedgerEntryKind,
        amount: Decimal,
        reference: Option<String>,
    ) -> LedgerEntry {
        self.account.balance += amount;
        let mut entry = LedgerEntry::new(
            self.account.id,
            kind,
            amount,
            self.account.balance,
            now_ms(),
        );
        if let Some(reference) = reference {
            entry = entry.with_reference(reference);
        }
        self.ledger.push(entry.clone());
        entry
    }

    /// Ids of open positions on one symbol.
    pub fn position_ids_on(&self, symbol: &Symbol) -> Vec<PositionId> {
        self.positions
            .iter()
            .filter(|(_, p)| &p.symbol == symbol)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The single open position on a symbol, if any (netting mode keeps at
    /// most one).
    pub fn net_position_on(&self, symbol: &Symbol) -> Option<PositionId> {
        self.position_ids_on(symbol).into_iter().next()
    }

    /// Recompute every derived value: per-position current price and
    /// unrealized P/L, account equity and used margin.
    ///
    /// Positions whose quote or cross rate is missing keep their previous
    /// values rather than failing the reprice.
    pub fn refresh(
        &mut self,
        specs: &HashMap<Symbol, SymbolSpec>,
        prices: &DashMap<Symbol, Tick>,
    ) {
        let currency = self.account.currency.clone();
        let leverage = self.account.leverage;
        let mut total_unrealized = Decimal::ZERO;
        let mut total_swap = Decimal::ZERO;
        let mut total_margin = Decimal::ZERO;

        for position in self.positions.values_mut() {
            let Some(spec) = specs.get(&position.symbol) else {
                continue;
            };
            if let Some(tick) = prices.get(&position.symbol) {
                let close_price = match position.side {
                    OrderSide::Buy => tick.bid,
                    OrderSide::Sell => tick.ask,
                };
                let quote_pl = position.quote_pl(close_price, spec.contract_size);
                if let Ok(pl) = convert(prices, quote_pl, &spec.quote_currency, &currency) {
                    position.current_price = close_price;
                    position.unrealized_pl = pl;
                }
            }
            total_unrealized += position.unrealized_pl;
            total_swap += position.swap;
            if let Ok(margin) = required_margin(
                prices,
                spec,
                position.volume,
                position.open_price,
                leverage,
                &currency,
            ) {
                total_margin += margin;
            }
        }

        self.account.equity =
            self.account.balance + self.account.credit + total_unrealized - total_swap;
        self.account.margin_used = total_margin;
    }
}
