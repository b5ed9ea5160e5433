//! The engine: order execution, position lifecycle, risk enforcement.

use crate::accounts::AccountBook;
use crate::config::{EngineConfig, ExecutionMode};
use crate::error::{EngineError, EngineResult};
use crate::margin::{convert, required_margin};
use dashmap::DashMap;
use fxb_core::{
    now_ms, Account, AccountId, AccountStatus, AccountUpdate, CloseReason, LedgerEntry,
    LedgerEntryKind, MarginCallAction, MarginMode, Order, OrderId, OrderSide, OrderState,
    OrderType, Position, PositionId, Price, StreamEvent, Symbol, SymbolSpec, Tick, Volume,
};
use fxb_telemetry::metrics::{
    ENGINE_FILLS_TOTAL, ENGINE_MARGIN_CALLS_TOTAL, ENGINE_REJECTS_TOTAL, ENGINE_STOPOUTS_TOTAL,
};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An order handed to the FIX gateway in A-book mode.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedOrder {
    pub cl_ord_id: String,
    pub account: AccountId,
    pub order: Order,
    pub quote_currency: String,
}

/// Result of a routed order, reported back by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpFillStatus {
    Filled,
    Rejected,
}

/// Fill (or rejection) of a routed order.
#[derive(Debug, Clone, PartialEq)]
pub struct LpFill {
    pub cl_ord_id: String,
    pub status: LpFillStatus,
    pub price: Option<Price>,
}

/// A routed order waiting for its LP execution.
#[derive(Debug, Clone)]
struct RoutedPending {
    account: AccountId,
    order: Order,
}

/// The authoritative owner of account, order, position and ledger state.
///
/// All mutations for one account run under that account's lock; events are
/// emitted while the lock is held, so per-account causal order is
/// guaranteed. The event channel is unbounded precisely because sends must
/// not block or fail under the lock; the hub's per-client queues are where
/// backpressure is applied.
pub struct Engine {
    config: EngineConfig,
    symbols: RwLock<HashMap<Symbol, SymbolSpec>>,
    accounts: DashMap<AccountId, Arc<Mutex<AccountBook>>>,
    /// Accounts holding positions or pending orders per symbol; pruned
    /// lazily during reprice.
    by_symbol: DashMap<Symbol, HashSet<AccountId>>,
    /// Latest accepted tick per symbol (also the cross-rate source).
    prices: DashMap<Symbol, Tick>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    router_tx: mpsc::UnboundedSender<RoutedOrder>,
    routed: DashMap<String, RoutedPending>,
    exec_mode: RwLock<ExecutionMode>,
    next_account_id: AtomicU64,
    next_order_id: AtomicU64,
    next_position_id: AtomicU64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<StreamEvent>,
        mpsc::UnboundedReceiver<RoutedOrder>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            config,
            symbols: RwLock::new(HashMap::new()),
            accounts: DashMap::new(),
            by_symbol: DashMap::new(),
            prices: DashMap::new(),
            events_tx,
            router_tx,
            routed: DashMap::new(),
            exec_mode: RwLock::new(ExecutionMode::default()),
            next_account_id: AtomicU64::new(1001),
            next_order_id: AtomicU64::new(1),
            next_position_id: AtomicU64::new(1),
        });
        (engine, events_rx, router_rx)
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events_tx.send(event);
    }

    // === Catalog and mode ===

    pub fn upsert_symbol(&self, spec: SymbolSpec) {
        self.symbols.write().insert(spec.symbol.clone(), spec);
    }

    pub fn set_symbol_enabled(&self, symbol: &Symbol, enabled: bool) -> EngineResult<()> {
        let mut symbols = self.symbols.write();
        let spec = symbols
            .get_mut(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
        spec.enabled = enabled;
        Ok(())
    }

    pub fn symbol(&self, symbol: &Symbol) -> Option<SymbolSpec> {
        self.symbols.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<SymbolSpec> {
        self.symbols.read().values().cloned().collect()
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        *self.exec_mode.write() = mode;
        info!(?mode, "execution mode changed");
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        *self.exec_mode.read()
    }

    pub fn latest_price(&self, symbol: &Symbol) -> Option<Tick> {
        self.prices.get(symbol).map(|t| t.clone())
    }

    // === Accounts ===

    pub fn create_account(
        &self,
        currency: impl Into<String>,
        leverage: Option<u32>,
        margin_mode: Option<MarginMode>,
        initial_deposit: Decimal,
    ) -> AccountId {
        let id = AccountId::new(self.next_account_id.fetch_add(1, Ordering::Relaxed));
        let account = Account::new(
            id,
            currency,
            leverage.unwrap_or(self.config.default_leverage),
            margin_mode.unwrap_or(self.config.default_margin_mode),
        );
        let mut book = AccountBook::new(account);
        if !initial_deposit.is_zero() {
            book.post_ledger(LedgerEntryKind::Deposit, initial_deposit, None);
        }
        book.account.equity = book.account.balance;
        self.accounts.insert(id, Arc::new(Mutex::new(book)));
        info!(account = %id, "account created");
        id
    }

    fn book(&self, id: AccountId) -> EngineResult<Arc<Mutex<AccountBook>>> {
        self.accounts
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::UnknownAccount(id))
    }

    pub fn account(&self, id: AccountId) -> EngineResult<Account> {
        Ok(self.book(id)?.lock().account.clone())
    }

    pub fn ledger(&self, id: AccountId) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self.book(id)?.lock().ledger.clone())
    }

    pub fn open_positions(&self, id: AccountId) -> EngineResult<Vec<Position>> {
        Ok(self.book(id)?.lock().positions.values().cloned().collect())
    }

    pub fn pending_orders(&self, id: AccountId) -> EngineResult<Vec<Order>> {
        Ok(self.book(id)?.lock().pending.values().cloned().collect())
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn deposit(&self, id: AccountId, amount: Decimal) -> EngineResult<()> {
        let book = self.book(id)?;
        let mut book = book.lock();
        book.post_ledger(LedgerEntryKind::Deposit, amount, None);
        self.refresh_and_publish(&mut book);
        Ok(())
    }

    pub fn withdraw(&self, id: AccountId, amount: Decimal) -> EngineResult<()> {
        let book = self.book(id)?;
        let mut book = book.lock();
        self.refresh_book(&mut book);
        if amount > book.account.free_margin() || amount > book.account.balance {
            return Err(EngineError::InsufficientMargin);
        }
        book.post_ledger(LedgerEntryKind::Withdrawal, -amount, None);
        self.refresh_and_publish(&mut book);
        Ok(())
    }

    /// Admin reset: close state bookkeeping for a demo account.
    pub fn reset_account(&self, id: AccountId, balance: Decimal) -> EngineResult<()> {
        let book = self.book(id)?;
        let mut book = book.lock();
        book.positions.clear();
        book.pending.clear();
        let adjustment = balance - book.account.balance;
        book.post_ledger(LedgerEntryKind::Adjustment, adjustment, Some("reset".into()));
        book.margin_call_latched = false;
        book.account.status = AccountStatus::Active;
        self.refresh_and_publish(&mut book);
        Ok(())
    }

    /// Accrue swap on an open position (driven by the rollover scheduler).
    /// Swap reduces equity while the position is open and settles into the
    /// ledger at close.
    pub fn accrue_swap(
        &self,
        id: AccountId,
        position_id: PositionId,
        amount: Decimal,
    ) -> EngineResult<()> {
        let book = self.book(id)?;
        let mut book = book.lock();
        let position = book
            .positions
            .get_mut(&position_id)
            .ok_or(EngineError::UnknownPosition(position_id))?;
        position.swap += amount;
        self.refresh_and_publish(&mut book);
        Ok(())
    }

    // === Orders ===

    /// Place a market order. In B-book mode it fills immediately at the
    /// current ask/bid (plus mark-up); in A-book mode it is routed to the
    /// LP and fills when the ExecutionReport arrives.
    ///
    /// Returns the order and, for an immediate fill, the affected position.
    pub fn place_market_order(
        &self,
        account: AccountId,
        symbol: &Symbol,
        side: OrderSide,
        volume: Volume,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> EngineResult<(Order, Option<PositionId>)> {
        let book = self.book(account)?;
        let mut book = book.lock();
        let spec = self.validate_order_inputs(&book, symbol, volume)?;
        let tick = self.fresh_tick(symbol)?;
        let fill_price = self.fill_price(&spec, side, &tick);
        let market_close = self.close_side_price(side, &tick);
        validate_stops(side, fill_price, market_close, spec.pip, stop_loss, take_profit)?;

        self.refresh_book(&mut book);
        let increase = self.exposure_increase(&book, &spec, side, volume);
        self.check_margin(&book, &spec, increase, fill_price)?;

        let mut order = self.new_order(account, symbol, side, OrderType::Market, volume);
        order.stop_loss = stop_loss;
        order.take_profit = take_profit;

        if self.execution_mode() == ExecutionMode::ABook {
            let cl_ord_id = format!("fxb-{}", order.id);
            self.routed.insert(
                cl_ord_id.clone(),
                RoutedPending {
                    account,
                    order: order.clone(),
                },
            );
            let _ = self.router_tx.send(RoutedOrder {
                cl_ord_id,
                account,
                order: order.clone(),
                quote_currency: spec.quote_currency.clone(),
            });
            self.emit(StreamEvent::OrderNew {
                order: order.clone(),
                timestamp: now_ms(),
            });
            return Ok((order, None));
        }

        let position = self.apply_fill(
            &mut book,
            &spec,
            side,
            volume,
            fill_price,
            stop_loss,
            take_profit,
        )?;
        order.state = OrderState::Filled;
        order.fill_price = Some(fill_price);
        order.fill_time_ms = Some(now_ms());
        ENGINE_FILLS_TOTAL
            .with_label_values(&[symbol.as_str(), &side.to_string()])
            .inc();
        self.emit(StreamEvent::OrderNew {
            order: order.clone(),
            timestamp: now_ms(),
        });
        self.refresh_and_publish(&mut book);
        Ok((order, position))
    }

    /// Store a limit/stop/stop-limit order; it is evaluated on every
    /// accepted tick for its symbol.
    #[allow(clippy::too_many_arguments)]
    pub fn place_pending_order(
        &self,
        account: AccountId,
        symbol: &Symbol,
        side: OrderSide,
        order_type: OrderType,
        volume: Volume,
        price: Price,
        stop_price: Option<Price>,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> EngineResult<Order> {
        if order_type == OrderType::Market {
            return Err(EngineError::InvalidOrderType);
        }
        let book = self.book(account)?;
        let mut book = book.lock();
        let _spec = self.validate_order_inputs(&book, symbol, volume)?;

        let mut order = self.new_order(account, symbol, side, order_type, volume);
        order.price = Some(price);
        order.stop_price = if order_type == OrderType::StopLimit {
            stop_price
        } else {
            None
        };
        order.stop_loss = stop_loss;
        order.take_profit = take_profit;

        book.pending.insert(order.id, order.clone());
        self.index_account(symbol, account);
        self.emit(StreamEvent::OrderNew {
            order: order.clone(),
            timestamp: now_ms(),
        });
        debug!(order = %order.id, %symbol, "pending order stored");
        Ok(order)
    }

    /// Cancel a pending order.
    pub fn cancel_order(&self, account: AccountId, order_id: OrderId) -> EngineResult<Order> {
        let book = self.book(account)?;
        let mut book = book.lock();
        let mut order = book
            .pending
            .remove(&order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;
        order.state = OrderState::Cancelled;
        self.emit(StreamEvent::OrderClose {
            order: order.clone(),
            timestamp: now_ms(),
        });
        Ok(order)
    }

    /// Update a position's SL/TP with side validation.
    pub fn modify_position(
        &self,
        account: AccountId,
        position_id: PositionId,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> EngineResult<Position> {
        let book = self.book(account)?;
        let mut book = book.lock();
        let position = book
            .positions
            .get(&position_id)
            .ok_or(EngineError::UnknownPosition(position_id))?
            .clone();
        let spec = self
            .symbol(&position.symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(position.symbol.clone()))?;
        let tick = self.fresh_tick(&position.symbol)?;
        let market_close = self.close_side_price(position.side, &tick);
        validate_stops(
            position.side,
            position.open_price,
            market_close,
            spec.pip,
            stop_loss,
            take_profit,
        )?;

        let position = book.positions.get_mut(&position_id).expect("checked above");
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        let snapshot = position.clone();
        self.emit(StreamEvent::PositionModified {
            position: snapshot.clone(),
            timestamp: now_ms(),
        });
        Ok(snapshot)
    }

    /// Close a position fully, or partially when `volume` is given.
    pub fn close_position(
        &self,
        account: AccountId,
        position_id: PositionId,
        volume: Option<Volume>,
    ) -> EngineResult<Position> {
        let book = self.book(account)?;
        let mut book = book.lock();
        let position = book
            .positions
            .get(&position_id)
            .ok_or(EngineError::UnknownPosition(position_id))?
            .clone();
        let spec = self
            .symbol(&position.symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(position.symbol.clone()))?;
        let tick = self.fresh_tick(&position.symbol)?;
        let close_price = self.close_side_price(position.side, &tick);

        let close_volume = volume.unwrap_or(position.volume);
        if close_volume > position.volume || !close_volume.is_positive() {
            return Err(EngineError::VolumeOutOfRange);
        }
        let remaining = position.volume - close_volume;
        if !remaining.is_zero() && remaining < spec.volume_min {
            return Err(EngineError::VolumeOutOfRange);
        }

        self.close_internal(
            &mut book,
            &spec,
            position_id,
            close_volume,
            close_price,
            CloseReason::Manual,
        )?;
        self.refresh_and_publish(&mut book);
        Ok(book
            .positions
            .get(&position_id)
            .cloned()
            .unwrap_or_else(|| {
                // Fully closed: return the terminal snapshot from the event
                // path by reconstructing it is unnecessary; look it up in
                // the closed cache instead.
                book.last_closed.clone().expect("position just closed")
            }))
    }

    // === Tick-driven repricing ===

    /// Reprice every account exposed to the ticked symbol, then evaluate
    /// SL/TP, pending-order triggers and margin levels.
    pub fn on_tick(&self, tick: &Tick) {
        self.prices.insert(tick.symbol.clone(), tick.clone());

        let Some(ids) = self
            .by_symbol
            .get(&tick.symbol)
            .map(|set| set.iter().copied().collect::<Vec<_>>())
        else {
            return;
        };

        let mut stale: Vec<AccountId> = Vec::new();
        for id in ids {
            let Ok(book) = self.book(id) else { continue };
            let mut book = book.lock();
            self.reprice_account(&mut book, tick);
            if book.position_ids_on(&tick.symbol).is_empty()
                && !book
                    .pending
                    .values()
                    .any(|o| o.symbol == tick.symbol)
            {
                stale.push(id);
            }
        }
        if !stale.is_empty() {
            if let Some(mut set) = self.by_symbol.get_mut(&tick.symbol) {
                for id in stale {
                    set.remove(&id);
                }
            }
        }
    }

    fn reprice_account(&self, book: &mut AccountBook, tick: &Tick) {
        self.refresh_book(book);
        self.evaluate_stops(book, tick);
        self.evaluate_pending(book, tick);
        self.evaluate_margin(book);
    }

    /// SL first, then TP, per position on the ticked symbol.
    fn evaluate_stops(&self, book: &mut AccountBook, tick: &Tick) {
        let Some(spec) = self.symbol(&tick.symbol) else {
            return;
        };
        for position_id in book.position_ids_on(&tick.symbol) {
            let Some(position) = book.positions.get(&position_id) else {
                continue;
            };
            let close_price = self.close_side_price(position.side, tick);
            let reason = if position.stop_loss_hit(close_price) {
                Some(CloseReason::StopLoss)
            } else if position.take_profit_hit(close_price) {
                Some(CloseReason::TakeProfit)
            } else {
                None
            };
            if let Some(reason) = reason {
                let volume = position.volume;
                if let Err(e) =
                    self.close_internal(book, &spec, position_id, volume, close_price, reason)
                {
                    warn!(position = %position_id, ?e, "protective close failed");
                } else {
                    self.refresh_and_publish(book);
                }
            }
        }
    }

    /// Trigger pending orders whose condition is met by this tick.
    fn evaluate_pending(&self, book: &mut AccountBook, tick: &Tick) {
        let order_ids: Vec<OrderId> = book
            .pending
            .values()
            .filter(|o| o.symbol == tick.symbol)
            .map(|o| o.id)
            .collect();

        for order_id in order_ids {
            let Some(order) = book.pending.get_mut(&order_id) else {
                continue;
            };

            // Stop-limit: the stop leg activates first, leaving a plain
            // limit order behind.
            if order.order_type == OrderType::StopLimit {
                if let Some(stop_price) = order.stop_price {
                    let activated = match order.side {
                        OrderSide::Buy => tick.ask >= stop_price,
                        OrderSide::Sell => tick.bid <= stop_price,
                    };
                    if activated {
                        order.order_type = OrderType::Limit;
                        order.stop_price = None;
                    } else {
                        continue;
                    }
                }
            }

            let Some(trigger_price) = order.price else {
                continue;
            };
            let triggered = match (order.order_type, order.side) {
                (OrderType::Limit, OrderSide::Buy) => tick.ask <= trigger_price,
                (OrderType::Limit, OrderSide::Sell) => tick.bid >= trigger_price,
                (OrderType::Stop, OrderSide::Buy) => tick.ask >= trigger_price,
                (OrderType::Stop, OrderSide::Sell) => tick.bid <= trigger_price,
                _ => false,
            };
            if !triggered {
                continue;
            }

            let mut order = book.pending.remove(&order_id).expect("present above");
            match self.execute_triggered(book, &mut order, tick) {
                Ok(()) => {
                    self.refresh_and_publish(book);
                }
                Err(e) => {
                    ENGINE_REJECTS_TOTAL.with_label_values(&[e.code()]).inc();
                    order.state = OrderState::Rejected;
                    self.emit(StreamEvent::OrderClose {
                        order: order.clone(),
                        timestamp: now_ms(),
                    });
                    debug!(order = %order.id, code = e.code(), "triggered order rejected");
                }
            }
        }
    }

    /// A triggered pending order executes as a market order under the same
    /// validations.
    fn execute_triggered(
        &self,
        book: &mut AccountBook,
        order: &mut Order,
        tick: &Tick,
    ) -> EngineResult<()> {
        let spec = self.validate_order_inputs(book, &order.symbol, order.volume)?;
        let fill_price = self.fill_price(&spec, order.side, tick);
        self.refresh_book(book);
        let increase = self.exposure_increase(book, &spec, order.side, order.volume);
        self.check_margin(book, &spec, increase, fill_price)?;
        self.apply_fill(
            book,
            &spec,
            order.side,
            order.volume,
            fill_price,
            order.stop_loss,
            order.take_profit,
        )?;
        order.state = OrderState::Filled;
        order.fill_price = Some(fill_price);
        order.fill_time_ms = Some(now_ms());
        ENGINE_FILLS_TOTAL
            .with_label_values(&[order.symbol.as_str(), &order.side.to_string()])
            .inc();
        self.emit(StreamEvent::OrderModify {
            order: order.clone(),
            timestamp: now_ms(),
        });
        Ok(())
    }

    /// Margin-call warning (edge-triggered) and stop-out liquidation,
    /// largest loss first, until the level recovers above the call
    /// threshold or nothing is left to close.
    fn evaluate_margin(&self, book: &mut AccountBook) {
        let Some(level) = book.account.margin_level() else {
            // No margin in use; clear the latch.
            if book.margin_call_latched {
                book.margin_call_latched = false;
                if book.account.status == AccountStatus::MarginCall {
                    book.account.status = AccountStatus::Active;
                }
            }
            return;
        };

        if level < self.config.stop_out_level {
            self.stop_out(book);
            return;
        }

        if level < self.config.margin_call_level {
            if !book.margin_call_latched {
                book.margin_call_latched = true;
                book.account.status = AccountStatus::MarginCall;
                ENGINE_MARGIN_CALLS_TOTAL.inc();
                self.emit(StreamEvent::MarginCall {
                    login: book.account.id,
                    margin_level: level,
                    equity: book.account.equity,
                    margin: book.account.margin_used,
                    action: MarginCallAction::Warning,
                    timestamp: now_ms(),
                });
                self.publish_account(book);
            }
        } else if book.margin_call_latched {
            book.margin_call_latched = false;
            if book.account.status == AccountStatus::MarginCall {
                book.account.status = AccountStatus::Active;
            }
            self.publish_account(book);
        }
    }

    fn stop_out(&self, book: &mut AccountBook) {
        loop {
            let level = match book.account.margin_level() {
                Some(level) if level < self.config.margin_call_level => level,
                _ => break,
            };
            // Largest loss first.
            let Some((position_id, symbol, side)) = book
                .positions
                .values()
                .min_by_key(|p| p.unrealized_pl)
                .map(|p| (p.id, p.symbol.clone(), p.side))
            else {
                break;
            };
            let Some(spec) = self.symbol(&symbol) else { break };
            let Some(tick) = self.latest_price(&symbol) else {
                break;
            };
            let close_price = match side {
                OrderSide::Buy => tick.bid,
                OrderSide::Sell => tick.ask,
            };
            let volume = match book.positions.get(&position_id) {
                Some(p) => p.volume,
                None => break,
            };

            ENGINE_STOPOUTS_TOTAL.inc();
            self.emit(StreamEvent::MarginCall {
                login: book.account.id,
                margin_level: level,
                equity: book.account.equity,
                margin: book.account.margin_used,
                action: MarginCallAction::StopOut,
                timestamp: now_ms(),
            });
            if self
                .close_internal(
                    book,
                    &spec,
                    position_id,
                    volume,
                    close_price,
                    CloseReason::StopOut,
                )
                .is_err()
            {
                break;
            }
            self.refresh_book(book);
        }
        let recovered = book
            .account
            .margin_level()
            .map(|level| level >= self.config.margin_call_level)
            .unwrap_or(true);
        if recovered {
            book.margin_call_latched = false;
            book.account.status = AccountStatus::Active;
        } else {
            book.margin_call_latched = true;
            book.account.status = AccountStatus::MarginCall;
        }
        self.publish_account(book);
    }

    // === A-book plumbing ===

    /// Apply the LP's answer to a routed order.
    pub fn apply_lp_fill(&self, fill: LpFill) {
        let Some((_, routed)) = self.routed.remove(&fill.cl_ord_id) else {
            debug!(cl_ord_id = %fill.cl_ord_id, "execution for unknown order");
            return;
        };
        let Ok(book) = self.book(routed.account) else {
            return;
        };
        let mut book = book.lock();
        let mut order = routed.order;

        match (fill.status, fill.price) {
            (LpFillStatus::Filled, Some(price)) => {
                let Some(spec) = self.symbol(&order.symbol) else {
                    return;
                };
                match self.apply_fill(
                    &mut book,
                    &spec,
                    order.side,
                    order.volume,
                    price,
                    order.stop_loss,
                    order.take_profit,
                ) {
                    Ok(_) => {
                        order.state = OrderState::Filled;
                        order.fill_price = Some(price);
                        order.fill_time_ms = Some(now_ms());
                        ENGINE_FILLS_TOTAL
                            .with_label_values(&[order.symbol.as_str(), &order.side.to_string()])
                            .inc();
                        self.emit(StreamEvent::OrderModify {
                            order,
                            timestamp: now_ms(),
                        });
                        self.refresh_and_publish(&mut book);
                    }
                    Err(e) => warn!(?e, "LP fill could not be applied"),
                }
            }
            _ => {
                order.state = OrderState::Rejected;
                ENGINE_REJECTS_TOTAL.with_label_values(&["lp-rejected"]).inc();
                self.emit(StreamEvent::OrderClose {
                    order,
                    timestamp: now_ms(),
                });
            }
        }
    }

    // === Internals ===

    fn new_order(
        &self,
        account: AccountId,
        symbol: &Symbol,
        side: OrderSide,
        order_type: OrderType,
        volume: Volume,
    ) -> Order {
        Order {
            id: OrderId(self.next_order_id.fetch_add(1, Ordering::Relaxed)),
            account,
            symbol: symbol.clone(),
            side,
            order_type,
            volume,
            price: None,
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            state: OrderState::Pending,
            fill_price: None,
            fill_time_ms: None,
            created_ms: now_ms(),
        }
    }

    fn validate_order_inputs(
        &self,
        book: &AccountBook,
        symbol: &Symbol,
        volume: Volume,
    ) -> EngineResult<SymbolSpec> {
        if book.account.status == AccountStatus::Suspended {
            let e = EngineError::AccountSuspended(book.account.id);
            ENGINE_REJECTS_TOTAL.with_label_values(&[e.code()]).inc();
            return Err(e);
        }
        let spec = self
            .symbol(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
        if !spec.enabled {
            let e = EngineError::SymbolDisabled(symbol.clone());
            ENGINE_REJECTS_TOTAL.with_label_values(&[e.code()]).inc();
            return Err(e);
        }
        if spec.validate_volume(volume).is_err() {
            ENGINE_REJECTS_TOTAL
                .with_label_values(&["volume-out-of-range"])
                .inc();
            return Err(EngineError::VolumeOutOfRange);
        }
        Ok(spec)
    }

    /// Latest tick for a symbol, rejected when absent or older than the
    /// configured quote age (market treated as closed).
    fn fresh_tick(&self, symbol: &Symbol) -> EngineResult<Tick> {
        let tick = self
            .latest_price(symbol)
            .ok_or_else(|| EngineError::PriceUnavailable(symbol.clone()))?;
        if now_ms() - tick.timestamp_ms > self.config.max_quote_age_ms {
            return Err(EngineError::MarketClosed(symbol.clone()));
        }
        Ok(tick)
    }

    /// Buys fill at ask, sells at bid, plus the configured mark-up.
    fn fill_price(&self, spec: &SymbolSpec, side: OrderSide, tick: &Tick) -> Price {
        let markup = spec.pip.inner() * self.config.markup_pips;
        match side {
            OrderSide::Buy => Price::new(tick.ask.inner() + markup),
            OrderSide::Sell => Price::new(tick.bid.inner() - markup),
        }
    }

    /// The price a position on `side` would close at right now.
    fn close_side_price(&self, side: OrderSide, tick: &Tick) -> Price {
        match side {
            OrderSide::Buy => tick.bid,
            OrderSide::Sell => tick.ask,
        }
    }

    /// How much of an order's volume adds exposure (netting reduces first).
    fn exposure_increase(
        &self,
        book: &AccountBook,
        spec: &SymbolSpec,
        side: OrderSide,
        volume: Volume,
    ) -> Volume {
        if book.account.margin_mode != MarginMode::Netting {
            return volume;
        }
        match book
            .net_position_on(&spec.symbol)
            .and_then(|id| book.positions.get(&id))
        {
            Some(existing) if existing.side != side => {
                if volume > existing.volume {
                    volume - existing.volume
                } else {
                    Volume::ZERO
                }
            }
            _ => volume,
        }
    }

    fn check_margin(
        &self,
        book: &AccountBook,
        spec: &SymbolSpec,
        increase: Volume,
        price: Price,
    ) -> EngineResult<()> {
        if increase.is_zero() {
            return Ok(());
        }
        let required = required_margin(
            &self.prices,
            spec,
            increase,
            price,
            book.account.leverage,
            &book.account.currency,
        )?;
        if required > book.account.free_margin() {
            ENGINE_REJECTS_TOTAL
                .with_label_values(&["insufficient-margin"])
                .inc();
            return Err(EngineError::InsufficientMargin);
        }
        Ok(())
    }

    /// B-book bookkeeping for a fill: open, stack (hedging) or net.
    fn apply_fill(
        &self,
        book: &mut AccountBook,
        spec: &SymbolSpec,
        side: OrderSide,
        volume: Volume,
        fill_price: Price,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> EngineResult<Option<PositionId>> {
        if book.account.margin_mode == MarginMode::Hedging {
            let id = self.open_position(book, spec, side, volume, fill_price, stop_loss, take_profit);
            return Ok(Some(id));
        }

        let Some(existing_id) = book.net_position_on(&spec.symbol) else {
            let id = self.open_position(book, spec, side, volume, fill_price, stop_loss, take_profit);
            return Ok(Some(id));
        };
        let existing = book.positions.get(&existing_id).expect("indexed").clone();

        if existing.side == side {
            // Same direction: volume-weighted average open price.
            let position = book.positions.get_mut(&existing_id).expect("indexed");
            let total = position.volume + volume;
            let weighted = (position.open_price.inner() * position.volume.inner()
                + fill_price.inner() * volume.inner())
                / total.inner();
            position.open_price = Price::new(weighted);
            position.volume = total;
            let commission = self.config.commission_per_lot * volume.inner();
            if !commission.is_zero() {
                position.commission += commission;
                let reference = format!("position:{existing_id}");
                book.post_ledger(LedgerEntryKind::Commission, -commission, Some(reference));
            }
            let snapshot = book.positions.get(&existing_id).expect("indexed").clone();
            self.emit(StreamEvent::PositionModified {
                position: snapshot,
                timestamp: now_ms(),
            });
            return Ok(Some(existing_id));
        }

        // Opposite direction: reduce, close, or flip.
        let reduce = volume.min(existing.volume);
        self.close_internal(book, spec, existing_id, reduce, fill_price, CloseReason::Manual)?;
        let remainder = volume - reduce;
        if remainder.is_positive() {
            let id = self.open_position(
                book,
                spec,
                side,
                remainder,
                fill_price,
                stop_loss,
                take_profit,
            );
            return Ok(Some(id));
        }
        if book.positions.contains_key(&existing_id) {
            Ok(Some(existing_id))
        } else {
            Ok(None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open_position(
        &self,
        book: &mut AccountBook,
        spec: &SymbolSpec,
        side: OrderSide,
        volume: Volume,
        fill_price: Price,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> PositionId {
        let id = PositionId(self.next_position_id.fetch_add(1, Ordering::Relaxed));
        let commission = self.config.commission_per_lot * volume.inner();
        let position = Position {
            id,
            account: book.account.id,
            symbol: spec.symbol.clone(),
            side,
            volume,
            open_price: fill_price,
            current_price: fill_price,
            unrealized_pl: Decimal::ZERO,
            commission,
            swap: Decimal::ZERO,
            stop_loss,
            take_profit,
            open_time_ms: now_ms(),
            close_time_ms: None,
            close_reason: None,
        };
        if !commission.is_zero() {
            book.post_ledger(
                LedgerEntryKind::Commission,
                -commission,
                Some(format!("position:{id}")),
            );
        }
        book.positions.insert(id, position.clone());
        self.index_account(&spec.symbol, book.account.id);
        self.emit(StreamEvent::PositionOpened {
            position,
            timestamp: now_ms(),
        });
        id
    }

    /// Close `volume` of a position at `close_price`, realizing P/L into
    /// the ledger. A full close removes the position; a partial close
    /// keeps the open price and emits a modification.
    fn close_internal(
        &self,
        book: &mut AccountBook,
        spec: &SymbolSpec,
        position_id: PositionId,
        volume: Volume,
        close_price: Price,
        reason: CloseReason,
    ) -> EngineResult<()> {
        let position = book
            .positions
            .get(&position_id)
            .ok_or(EngineError::UnknownPosition(position_id))?
            .clone();

        let mut closing_part = position.clone();
        closing_part.volume = volume;
        let quote_pl = closing_part.quote_pl(close_price, spec.contract_size);
        let realized = convert(
            &self.prices,
            quote_pl,
            &spec.quote_currency,
            &book.account.currency,
        )?;

        book.post_ledger(
            LedgerEntryKind::RealizedPl,
            realized,
            Some(format!("position:{position_id}")),
        );

        if volume == position.volume {
            // Accrued swap settles on full close.
            if !position.swap.is_zero() {
                book.post_ledger(
                    LedgerEntryKind::Swap,
                    -position.swap,
                    Some(format!("position:{position_id}")),
                );
            }
            let mut closed = book.positions.remove(&position_id).expect("checked above");
            closed.current_price = close_price;
            closed.unrealized_pl = Decimal::ZERO;
            closed.close_time_ms = Some(now_ms());
            closed.close_reason = Some(reason);
            book.last_closed = Some(closed.clone());
            self.emit(StreamEvent::PositionClosed {
                position: closed,
                close_price,
                realized_pl: realized,
                reason,
                timestamp: now_ms(),
            });
        } else {
            let remaining = book.positions.get_mut(&position_id).expect("checked above");
            remaining.volume = remaining.volume - volume;
            remaining.current_price = close_price;
            let snapshot = remaining.clone();
            self.emit(StreamEvent::PositionModified {
                position: snapshot,
                timestamp: now_ms(),
            });
        }
        Ok(())
    }

    fn index_account(&self, symbol: &Symbol, account: AccountId) {
        self.by_symbol
            .entry(symbol.clone())
            .or_default()
            .insert(account);
    }

    fn refresh_book(&self, book: &mut AccountBook) {
        let symbols = self.symbols.read();
        book.refresh(&symbols, &self.prices);
    }

    fn refresh_and_publish(&self, book: &mut AccountBook) {
        self.refresh_book(book);
        self.publish_account(book);
    }

    fn publish_account(&self, book: &AccountBook) {
        self.emit(StreamEvent::AccountUpdate {
            account: AccountUpdate::from(&book.account),
            timestamp: now_ms(),
        });
    }
}

/// SL must sit on the loss side of the reference price, TP on the profit
/// side, and both at least one pip away from the current market.
fn validate_stops(
    side: OrderSide,
    reference: Price,
    market_close: Price,
    pip: Price,
    stop_loss: Option<Price>,
    take_profit: Option<Price>,
) -> EngineResult<()> {
    match side {
        OrderSide::Buy => {
            if let Some(sl) = stop_loss {
                if sl >= reference || sl > market_close - pip {
                    return Err(EngineError::StopTooClose);
                }
            }
            if let Some(tp) = take_profit {
                if tp <= reference || tp < market_close + pip {
                    return Err(EngineError::StopTooClose);
                }
            }
        }
        OrderSide::Sell => {
            if let Some(sl) = stop_loss {
                if sl <= reference || sl < market_close + pip {
                    return Err(EngineError::StopTooClose);
                }
            }
            if let Some(tp) = take_profit {
                if tp >= reference || tp > market_close - pip {
                    return Err(EngineError::StopTooClose);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxb_core::ProductClass;
    use rust_decimal_macros::dec;

    pub type EventRx = mpsc::UnboundedReceiver<StreamEvent>;
    pub type RouteRx = mpsc::UnboundedReceiver<RoutedOrder>;

    pub fn eurusd() -> SymbolSpec {
        SymbolSpec {
            symbol: Symbol::new("EURUSD"),
            digits: 5,
            pip: SymbolSpec::pip_for_digits(5),
            volume_min: Volume::new(dec!(0.01)),
            volume_max: Volume::new(dec!(100)),
            volume_step: Volume::new(dec!(0.01)),
            contract_size: dec!(100000),
            quote_currency: "USD".to_string(),
            product: ProductClass::Forex,
            enabled: true,
        }
    }

    pub fn engine_with(config: EngineConfig) -> (Arc<Engine>, EventRx, RouteRx) {
        let (engine, events_rx, router_rx) = Engine::new(config);
        engine.upsert_symbol(eurusd());
        (engine, events_rx, router_rx)
    }

    pub fn engine() -> (Arc<Engine>, EventRx, RouteRx) {
        engine_with(EngineConfig::default())
    }

    pub fn tick(bid: Decimal, ask: Decimal) -> Tick {
        Tick::new("EURUSD", Price::new(bid), Price::new(ask), now_ms(), "LP1")
    }

    fn drain(rx: &mut EventRx) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn assert_ledger_consistent(engine: &Engine, id: AccountId) {
        let account = engine.account(id).unwrap();
        let ledger = engine.ledger(id).unwrap();
        assert_eq!(
            account.balance,
            ledger.last().map(|e| e.balance_after).unwrap_or_default(),
            "balance must equal the last ledger snapshot"
        );
    }

    fn assert_equity_invariant(engine: &Engine, id: AccountId) {
        let account = engine.account(id).unwrap();
        let positions = engine.open_positions(id).unwrap();
        let sum_pl: Decimal = positions.iter().map(|p| p.unrealized_pl).sum();
        let sum_swap: Decimal = positions.iter().map(|p| p.swap).sum();
        assert_eq!(account.equity, account.balance + account.credit + sum_pl - sum_swap);
        assert!(account.margin_used >= Decimal::ZERO);
    }

    #[test]
    fn market_buy_opens_position() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));

        let (order, position_id) = engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.fill_price, Some(Price::new(dec!(1.0855))));
        let position_id = position_id.unwrap();

        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, position_id);
        assert_eq!(positions[0].open_price, Price::new(dec!(1.0855)));

        let kinds: Vec<&str> = drain(&mut events)
            .iter()
            .map(|e| match e {
                StreamEvent::PositionOpened { .. } => "position_opened",
                StreamEvent::OrderNew { .. } => "order_new",
                StreamEvent::AccountUpdate { .. } => "account_update",
                _ => "other",
            })
            .collect::<Vec<_>>();
        assert!(kinds.contains(&"position_opened"));
        assert!(kinds.contains(&"order_new"));
        assert_ledger_consistent(&engine, id);
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn scenario_b_stop_loss_close() {
        let (engine, mut events, _routes) = engine_with(EngineConfig {
            commission_per_lot: dec!(7),
            ..EngineConfig::default()
        });
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));

        engine
            .place_market_order(
                id,
                &Symbol::new("EURUSD"),
                OrderSide::Buy,
                Volume::new(dec!(0.10)),
                Some(Price::new(dec!(1.0840))),
                None,
            )
            .unwrap();
        drain(&mut events);

        // The stop level is crossed: bid 1.0839.
        engine.on_tick(&tick(dec!(1.0839), dec!(1.0840)));

        let positions = engine.open_positions(id).unwrap();
        assert!(positions.is_empty());

        let closed = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                StreamEvent::PositionClosed { position, close_price, realized_pl, reason, .. } => {
                    Some((position, close_price, realized_pl, reason))
                }
                _ => None,
            })
            .expect("position_closed event");
        assert_eq!(closed.1, Price::new(dec!(1.0839)));
        assert_eq!(closed.2, dec!(-16.000000));
        assert_eq!(closed.3, CloseReason::StopLoss);

        let ledger = engine.ledger(id).unwrap();
        let kinds: Vec<LedgerEntryKind> = ledger.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LedgerEntryKind::Deposit,
                LedgerEntryKind::Commission,
                LedgerEntryKind::RealizedPl
            ]
        );
        assert_eq!(ledger[1].amount, dec!(-0.70));
        assert_eq!(ledger[2].amount, dec!(-16.000000));

        let account = engine.account(id).unwrap();
        assert_eq!(account.balance, dec!(9983.300000));
        assert_eq!(account.equity, account.balance);
        assert_ledger_consistent(&engine, id);
    }

    #[test]
    fn scenario_c_netting_reduce() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Netting), dec!(100000));
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(1.0)), None, None)
            .unwrap();
        drain(&mut events);

        engine.on_tick(&tick(dec!(1.0870), dec!(1.0872)));
        drain(&mut events);
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Sell, Volume::new(dec!(0.4)), None, None)
            .unwrap();

        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].volume, Volume::new(dec!(0.6)));
        assert_eq!(positions[0].open_price, Price::new(dec!(1.0850)));
        assert_eq!(positions[0].side, OrderSide::Buy);

        let events = drain(&mut events);
        let modified: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::PositionModified { .. }))
            .collect();
        assert_eq!(modified.len(), 1, "single position_modified event");
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::PositionClosed { .. })));

        let ledger = engine.ledger(id).unwrap();
        let realized = ledger
            .iter()
            .find(|e| e.kind == LedgerEntryKind::RealizedPl)
            .unwrap();
        assert_eq!(realized.amount, dec!(80.00000));
        assert_ledger_consistent(&engine, id);
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn netting_same_side_volume_weighted() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Netting), dec!(100000));
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(1.0)), None, None)
            .unwrap();
        engine.on_tick(&tick(dec!(1.0858), dec!(1.0860)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(1.0)), None, None)
            .unwrap();

        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1, "netting keeps one position per symbol");
        assert_eq!(positions[0].volume, Volume::new(dec!(2.0)));
        assert_eq!(positions[0].open_price, Price::new(dec!(1.0855)));
    }

    #[test]
    fn netting_flip_closes_and_reopens() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Netting), dec!(100000));
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.5)), None, None)
            .unwrap();
        drain(&mut events);

        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Sell, Volume::new(dec!(0.8)), None, None)
            .unwrap();
        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, OrderSide::Sell);
        assert_eq!(positions[0].volume, Volume::new(dec!(0.3)));

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::PositionClosed { .. })));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::PositionOpened { .. })));
    }

    #[test]
    fn hedging_stacks_positions() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(100000));
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));
        for _ in 0..3 {
            engine
                .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
                .unwrap();
        }
        assert_eq!(engine.open_positions(id).unwrap().len(), 3);
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn validation_rejections() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), None, dec!(10));
        let symbol = Symbol::new("EURUSD");

        // No quote yet.
        assert_eq!(
            engine.place_market_order(id, &symbol, OrderSide::Buy, Volume::new(dec!(0.10)), None, None),
            Err(EngineError::PriceUnavailable(symbol.clone()))
        );

        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));

        // Volume below the minimum, then not a step multiple.
        assert_eq!(
            engine.place_market_order(id, &symbol, OrderSide::Buy, Volume::new(dec!(0.005)), None, None),
            Err(EngineError::VolumeOutOfRange)
        );
        assert_eq!(
            engine.place_market_order(id, &symbol, OrderSide::Buy, Volume::new(dec!(0.015)), None, None),
            Err(EngineError::VolumeOutOfRange)
        );

        // 10 USD of equity cannot carry one lot.
        assert_eq!(
            engine.place_market_order(id, &symbol, OrderSide::Buy, Volume::new(dec!(1.0)), None, None),
            Err(EngineError::InsufficientMargin)
        );

        // Disabled symbol.
        engine.set_symbol_enabled(&symbol, false).unwrap();
        assert_eq!(
            engine.place_market_order(id, &symbol, OrderSide::Buy, Volume::new(dec!(0.10)), None, None),
            Err(EngineError::SymbolDisabled(symbol.clone()))
        );
        engine.set_symbol_enabled(&symbol, true).unwrap();

        // Stops on the wrong side.
        assert_eq!(
            engine.place_market_order(
                id,
                &symbol,
                OrderSide::Buy,
                Volume::new(dec!(0.01)),
                Some(Price::new(dec!(1.0851))),
                None
            ),
            Err(EngineError::StopTooClose)
        );
        assert_eq!(engine.open_positions(id).unwrap().len(), 0, "no state mutated");
        assert_ledger_consistent(&engine, id);
    }

    #[test]
    fn pending_limit_buy_triggers() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0858), dec!(1.0860)));

        let order = engine
            .place_pending_order(
                id,
                &Symbol::new("EURUSD"),
                OrderSide::Buy,
                OrderType::Limit,
                Volume::new(dec!(0.10)),
                Price::new(dec!(1.0850)),
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(order.state, OrderState::Pending);
        drain(&mut events);

        // Not yet: ask still above the limit.
        engine.on_tick(&tick(dec!(1.0853), dec!(1.0855)));
        assert_eq!(engine.pending_orders(id).unwrap().len(), 1);

        // Ask touches the limit: fill as market.
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));
        assert!(engine.pending_orders(id).unwrap().is_empty());
        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].open_price, Price::new(dec!(1.0850)));
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn pending_stop_sell_triggers() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0858), dec!(1.0860)));

        engine
            .place_pending_order(
                id,
                &Symbol::new("EURUSD"),
                OrderSide::Sell,
                OrderType::Stop,
                Volume::new(dec!(0.10)),
                Price::new(dec!(1.0850)),
                None,
                None,
                None,
            )
            .unwrap();

        // Stop sell triggers when bid <= price.
        engine.on_tick(&tick(dec!(1.0849), dec!(1.0851)));
        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, OrderSide::Sell);
        assert_eq!(positions[0].open_price, Price::new(dec!(1.0849)));
    }

    #[test]
    fn stop_limit_activates_then_fills() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));

        // Buy stop-limit: activate at 1.0860, then buy at or below 1.0855.
        engine
            .place_pending_order(
                id,
                &Symbol::new("EURUSD"),
                OrderSide::Buy,
                OrderType::StopLimit,
                Volume::new(dec!(0.10)),
                Price::new(dec!(1.0855)),
                Some(Price::new(dec!(1.0860))),
                None,
                None,
            )
            .unwrap();

        // Activation: ask reaches the stop leg; limit not yet satisfied.
        engine.on_tick(&tick(dec!(1.0858), dec!(1.0860)));
        let pending = engine.pending_orders(id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_type, OrderType::Limit);

        // The limit leg fills once the ask comes back.
        engine.on_tick(&tick(dec!(1.0853), dec!(1.0855)));
        assert!(engine.pending_orders(id).unwrap().is_empty());
        assert_eq!(engine.open_positions(id).unwrap().len(), 1);
    }

    #[test]
    fn cancel_pending_order() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), None, dec!(10000));
        engine.on_tick(&tick(dec!(1.0858), dec!(1.0860)));
        let order = engine
            .place_pending_order(
                id,
                &Symbol::new("EURUSD"),
                OrderSide::Buy,
                OrderType::Limit,
                Volume::new(dec!(0.10)),
                Price::new(dec!(1.0850)),
                None,
                None,
                None,
            )
            .unwrap();
        drain(&mut events);

        let cancelled = engine.cancel_order(id, order.id).unwrap();
        assert_eq!(cancelled.state, OrderState::Cancelled);
        assert!(engine.pending_orders(id).unwrap().is_empty());
        assert!(matches!(
            engine.cancel_order(id, order.id),
            Err(EngineError::UnknownOrder(_))
        ));
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, StreamEvent::OrderClose { .. })));
    }

    #[test]
    fn partial_close_respects_minimum() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0848), dec!(1.0850)));
        let (_, position_id) = engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        let position_id = position_id.unwrap();
        drain(&mut events);

        // Remainder 0.005 would fall below the 0.01 minimum.
        assert_eq!(
            engine.close_position(id, position_id, Some(Volume::new(dec!(0.095)))),
            Err(EngineError::VolumeOutOfRange)
        );

        engine.on_tick(&tick(dec!(1.0868), dec!(1.0870)));
        drain(&mut events);
        let remaining = engine
            .close_position(id, position_id, Some(Volume::new(dec!(0.04))))
            .unwrap();
        assert_eq!(remaining.volume, Volume::new(dec!(0.06)));

        let realized = engine
            .ledger(id)
            .unwrap()
            .into_iter()
            .find(|e| e.kind == LedgerEntryKind::RealizedPl)
            .unwrap();
        // (1.0868 - 1.0850) * 100000 * 0.04 = 7.2
        assert_eq!(realized.amount, dec!(7.200000));
        assert_ledger_consistent(&engine, id);
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn modify_position_stops() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));
        let (_, position_id) = engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        let position_id = position_id.unwrap();

        let updated = engine
            .modify_position(
                id,
                position_id,
                Some(Price::new(dec!(1.0840))),
                Some(Price::new(dec!(1.0880))),
            )
            .unwrap();
        assert_eq!(updated.stop_loss, Some(Price::new(dec!(1.0840))));
        assert_eq!(updated.take_profit, Some(Price::new(dec!(1.0880))));

        // TP below the open price is on the wrong side.
        assert_eq!(
            engine.modify_position(id, position_id, None, Some(Price::new(dec!(1.0850)))),
            Err(EngineError::StopTooClose)
        );
    }

    #[test]
    fn margin_call_warning_once_per_crossing() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(200));
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        drain(&mut events);

        // Below the 100% call level (equity ~108 on margin 108.55).
        engine.on_tick(&tick(dec!(1.0763), dec!(1.0764)));
        let warnings = |events: &[StreamEvent]| {
            events
                .iter()
                .filter(|e| {
                    matches!(
                        e,
                        StreamEvent::MarginCall {
                            action: MarginCallAction::Warning,
                            ..
                        }
                    )
                })
                .count()
        };
        let first = drain(&mut events);
        assert_eq!(warnings(&first), 1);
        assert_eq!(
            engine.account(id).unwrap().status,
            AccountStatus::MarginCall
        );

        // Still below: no second warning.
        engine.on_tick(&tick(dec!(1.0762), dec!(1.0763)));
        assert_eq!(warnings(&drain(&mut events)), 0);

        // Recovered, then crossing again warns again.
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));
        drain(&mut events);
        assert_eq!(engine.account(id).unwrap().status, AccountStatus::Active);
        engine.on_tick(&tick(dec!(1.0763), dec!(1.0764)));
        assert_eq!(warnings(&drain(&mut events)), 1);
    }

    #[test]
    fn stop_out_closes_largest_loss_first() {
        let (engine, mut events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(300));
        engine.on_tick(&tick(dec!(1.0899), dec!(1.0900)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        engine.on_tick(&tick(dec!(1.0849), dec!(1.0850)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        drain(&mut events);

        // Heavy drop: both positions lose, the one opened at 1.0900 more.
        // Equity 300 - 140 - 90 = 70 on ~217.5 margin: level ~32%, well
        // below the 50% stop-out.
        engine.on_tick(&tick(dec!(1.0760), dec!(1.0761)));
        let events_now = drain(&mut events);
        let closed: Vec<_> = events_now
            .iter()
            .filter_map(|e| match e {
                StreamEvent::PositionClosed { position, reason, .. } => Some((position.clone(), *reason)),
                _ => None,
            })
            .collect();
        assert!(!closed.is_empty(), "stop-out must close at least one position");
        assert!(closed.iter().all(|(_, r)| *r == CloseReason::StopOut));
        // Largest loss first: the position opened at 1.0900.
        assert_eq!(closed[0].0.open_price, Price::new(dec!(1.0900)));

        let stop_out_events = events_now
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    StreamEvent::MarginCall {
                        action: MarginCallAction::StopOut,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(stop_out_events, closed.len(), "one stop-out event per close");

        // Level restored above the call threshold, or nothing left.
        let account = engine.account(id).unwrap();
        match account.margin_level() {
            Some(level) => assert!(level >= dec!(100)),
            None => assert!(engine.open_positions(id).unwrap().is_empty()),
        }
        assert_ledger_consistent(&engine, id);
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn a_book_routes_and_applies_lp_fill() {
        let (engine, mut events, mut routes) = engine();
        engine.set_execution_mode(ExecutionMode::ABook);
        let id = engine.create_account("USD", Some(100), Some(MarginMode::Hedging), dec!(10000));
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));

        let (order, position) = engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.10)), None, None)
            .unwrap();
        assert_eq!(order.state, OrderState::Pending);
        assert!(position.is_none());
        assert!(engine.open_positions(id).unwrap().is_empty());

        let routed = routes.try_recv().unwrap();
        assert_eq!(routed.account, id);
        assert_eq!(routed.order.id, order.id);
        drain(&mut events);

        engine.apply_lp_fill(LpFill {
            cl_ord_id: routed.cl_ord_id,
            status: LpFillStatus::Filled,
            price: Some(Price::new(dec!(1.0856))),
        });
        let positions = engine.open_positions(id).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].open_price, Price::new(dec!(1.0856)));
        assert_equity_invariant(&engine, id);
    }

    #[test]
    fn withdraw_respects_free_margin() {
        let (engine, _events, _routes) = engine();
        let id = engine.create_account("USD", Some(100), None, dec!(1000));
        engine.on_tick(&tick(dec!(1.0854), dec!(1.0855)));
        engine
            .place_market_order(id, &Symbol::new("EURUSD"), OrderSide::Buy, Volume::new(dec!(0.50)), None, None)
            .unwrap();
        // Margin used ~543; free ~457.
        assert_eq!(
            engine.withdraw(id, dec!(600)),
            Err(EngineError::InsufficientMargin)
        );
        engine.withdraw(id, dec!(100)).unwrap();
        assert_eq!(engine.account(id).unwrap().balance, dec!(900));
        assert_ledger_consistent(&engine, id);
    }
}
