//! Margin and cross-currency conversion math.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use fxb_core::{Price, Symbol, SymbolSpec, Tick, Volume};
use rust_decimal::Decimal;

/// Convert an amount denominated in `quote_currency` into `account_currency`
/// using the latest cached ticks.
///
/// Looks for the direct pair `<QUOTE><ACCOUNT>` first, then the reciprocal
/// `<ACCOUNT><QUOTE>`. With neither available the operation fails with
/// `price-unavailable` and no state is mutated.
pub fn convert(
    prices: &DashMap<Symbol, Tick>,
    amount: Decimal,
    quote_currency: &str,
    account_currency: &str,
) -> EngineResult<Decimal> {
    if quote_currency == account_currency || amount.is_zero() {
        return Ok(amount);
    }

    let direct = Symbol::new(format!("{quote_currency}{account_currency}"));
    if let Some(tick) = prices.get(&direct) {
        return Ok(amount * tick.mid().inner());
    }

    let reciprocal = Symbol::new(format!("{account_currency}{quote_currency}"));
    if let Some(tick) = prices.get(&reciprocal) {
        let mid = tick.mid().inner();
        if !mid.is_zero() {
            return Ok(amount / mid);
        }
    }

    Err(EngineError::PriceUnavailable(direct))
}

/// Margin required to hold `volume` of an instrument at `price`, in the
/// account currency: notional / leverage, converted from the quote currency.
pub fn required_margin(
    prices: &DashMap<Symbol, Tick>,
    spec: &SymbolSpec,
    volume: Volume,
    price: Price,
    leverage: u32,
    account_currency: &str,
) -> EngineResult<Decimal> {
    let notional = volume.notional(price, spec.contract_size);
    let margin = notional / Decimal::from(leverage.max(1));
    convert(prices, margin, &spec.quote_currency, account_currency)
}
