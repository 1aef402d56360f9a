//! In-memory exchange for tests and dry runs.
//!
//! Reduce orders fill instantly at the configured price and zero the
//! corresponding balance or contract position. Failures are injected per
//! call so every branch of the close path can be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use autoclose_core::{OrderSide, PositionKind, Price, Size, Symbol};
use autoclose_persistence::PositionRecord;

use crate::error::GatewayError;
use crate::flatten::FlattenRequest;
use crate::gateway::{
    BoxFuture, ContractPosition, ExchangeGateway, GatewayResult, LiquidationEvent, OrderAck,
    PnlSnapshot, DEFAULT_LOT_SIZE,
};
use crate::pnl::{realized_pnl_usd, unrealized_pnl_pct};

/// Entry terms of a short contract, used to mark it to the current price.
#[derive(Debug, Clone, Copy)]
struct ContractEntry {
    entry_price: Price,
    leverage: Decimal,
}

/// Paper exchange.
#[derive(Debug, Default)]
pub struct PaperExchange {
    prices: Mutex<HashMap<Symbol, Price>>,
    balances: Mutex<HashMap<String, Size>>,
    contracts: Mutex<HashMap<Symbol, ContractPosition>>,
    contract_entries: Mutex<HashMap<Symbol, ContractEntry>>,
    realized: Mutex<HashMap<Symbol, PnlSnapshot>>,
    unrealized: Mutex<HashMap<Symbol, VecDeque<GatewayResult<PnlSnapshot>>>>,
    lot_sizes: Mutex<HashMap<Symbol, Size>>,
    liquidations: Mutex<Vec<LiquidationEvent>>,
    /// Error returned by the next `place_reduce_order`, consumed once.
    next_order_error: Mutex<Option<GatewayError>>,
    /// Error returned by every `get_price` until cleared.
    price_error: Mutex<Option<GatewayError>>,
    /// Artificial latency applied to `get_price`.
    price_delay: Mutex<Option<Duration>>,
    orders: Mutex<Vec<FlattenRequest>>,
    price_calls: AtomicUsize,
    order_seq: AtomicUsize,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror an open position: price at entry, balance or contract equal
    /// to the recorded amount.
    pub fn seed_position(&self, record: &PositionRecord) {
        self.set_price(&record.symbol, record.entry_price);
        match record.kind {
            PositionKind::Directional => {
                let mut balances = self.balances.lock();
                let balance = balances
                    .entry(record.symbol.base_currency().to_string())
                    .or_insert(Size::ZERO);
                *balance = *balance + record.amount;
            }
            PositionKind::LeveragedShort => {
                self.set_contract(&record.symbol, record.amount, OrderSide::Sell);
                self.set_contract_entry(&record.symbol, record.entry_price, record.leverage);
            }
        }
    }

    pub fn set_price(&self, symbol: &Symbol, price: Price) {
        self.prices.lock().insert(symbol.clone(), price);
    }

    pub fn set_balance(&self, currency: &str, size: Size) {
        self.balances.lock().insert(currency.to_string(), size);
    }

    pub fn set_contract(&self, symbol: &Symbol, size: Size, side: OrderSide) {
        self.contracts
            .lock()
            .insert(symbol.clone(), ContractPosition { size, side });
    }

    /// Entry terms used to mark the contract when no unrealized PnL is queued.
    pub fn set_contract_entry(&self, symbol: &Symbol, entry_price: Price, leverage: Decimal) {
        self.contract_entries.lock().insert(
            symbol.clone(),
            ContractEntry {
                entry_price,
                leverage,
            },
        );
    }

    pub fn set_realized_pnl(&self, symbol: &Symbol, pnl: PnlSnapshot) {
        self.realized.lock().insert(symbol.clone(), pnl);
    }

    /// Queue unrealized PnL responses; the last one repeats once reached.
    pub fn push_unrealized_pnl(&self, symbol: &Symbol, response: GatewayResult<PnlSnapshot>) {
        self.unrealized
            .lock()
            .entry(symbol.clone())
            .or_default()
            .push_back(response);
    }

    pub fn set_lot_size(&self, symbol: &Symbol, lot: Size) {
        self.lot_sizes.lock().insert(symbol.clone(), lot);
    }

    pub fn push_liquidation(&self, event: LiquidationEvent) {
        self.liquidations.lock().push(event);
    }

    pub fn fail_next_order(&self, error: GatewayError) {
        *self.next_order_error.lock() = Some(error);
    }

    pub fn set_price_error(&self, error: Option<GatewayError>) {
        *self.price_error.lock() = error;
    }

    pub fn set_price_delay(&self, delay: Option<Duration>) {
        *self.price_delay.lock() = delay;
    }

    /// Reduce orders accepted so far.
    pub fn orders(&self) -> Vec<FlattenRequest> {
        self.orders.lock().clone()
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    /// Unrealized PnL of the seeded short, marked to the current price.
    fn marked_pnl(&self, symbol: &Symbol) -> GatewayResult<PnlSnapshot> {
        let unavailable = || GatewayError::Unavailable(format!("no position data for {symbol}"));

        let contract = self
            .contracts
            .lock()
            .get(symbol)
            .copied()
            .filter(|c| c.size.is_positive())
            .ok_or_else(unavailable)?;
        let entry = self
            .contract_entries
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(unavailable)?;
        let price = self
            .prices
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(unavailable)?;

        let pnl_percent = unrealized_pnl_pct(
            PositionKind::LeveragedShort,
            entry.entry_price,
            price,
            entry.leverage,
        )
        .ok_or_else(unavailable)?;
        Ok(PnlSnapshot {
            pnl_usd: realized_pnl_usd(
                PositionKind::LeveragedShort,
                entry.entry_price,
                price,
                contract.size,
            ),
            pnl_percent,
            fee: None,
            exit_price: None,
        })
    }

    fn fill(&self, request: &FlattenRequest) {
        match request.side {
            // Selling a spot holding.
            OrderSide::Sell => {
                let mut balances = self.balances.lock();
                if let Some(balance) = balances.get_mut(request.symbol.base_currency()) {
                    *balance = (*balance - request.size).max(Size::ZERO);
                }
            }
            // Buying back a short.
            OrderSide::Buy => {
                let mut contracts = self.contracts.lock();
                if let Some(pos) = contracts.get_mut(&request.symbol) {
                    pos.size = (pos.size - request.size).max(Size::ZERO);
                }
            }
        }
    }
}

impl ExchangeGateway for PaperExchange {
    fn get_price<'a>(&'a self, symbol: &'a Symbol) -> BoxFuture<'a, GatewayResult<Price>> {
        Box::pin(async move {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.price_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.price_error.lock().clone() {
                return Err(err);
            }
            self.prices
                .lock()
                .get(symbol)
                .copied()
                .ok_or_else(|| GatewayError::InvalidPriceData(format!("no price for {symbol}")))
        })
    }

    fn get_balance<'a>(&'a self, currency: &'a str) -> BoxFuture<'a, GatewayResult<Size>> {
        Box::pin(async move {
            Ok(self
                .balances
                .lock()
                .get(currency)
                .copied()
                .unwrap_or(Size::ZERO))
        })
    }

    fn get_contract_position<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> BoxFuture<'a, GatewayResult<ContractPosition>> {
        Box::pin(async move {
            Ok(self
                .contracts
                .lock()
                .get(symbol)
                .copied()
                .unwrap_or_else(|| ContractPosition::flat(OrderSide::Sell)))
        })
    }

    fn place_reduce_order<'a>(
        &'a self,
        request: &'a FlattenRequest,
    ) -> BoxFuture<'a, GatewayResult<OrderAck>> {
        Box::pin(async move {
            if let Some(err) = self.next_order_error.lock().take() {
                return Err(err);
            }
            self.fill(request);
            self.orders.lock().push(request.clone());
            let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(OrderAck {
                order_id: format!("paper-{seq}"),
            })
        })
    }

    fn get_realized_pnl<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> BoxFuture<'a, GatewayResult<PnlSnapshot>> {
        Box::pin(async move {
            self.realized
                .lock()
                .get(symbol)
                .cloned()
                .ok_or_else(|| GatewayError::Unavailable(format!("no close history for {symbol}")))
        })
    }

    fn get_unrealized_pnl<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> BoxFuture<'a, GatewayResult<PnlSnapshot>> {
        Box::pin(async move {
            let queued = {
                let mut unrealized = self.unrealized.lock();
                unrealized.get_mut(symbol).and_then(|queue| match queue.len() {
                    0 => None,
                    1 => queue.front().cloned(),
                    _ => queue.pop_front(),
                })
            };
            match queued {
                Some(response) => response,
                None => self.marked_pnl(symbol),
            }
        })
    }

    fn get_forced_liquidations(
        &self,
        _window: Duration,
    ) -> BoxFuture<'_, GatewayResult<Vec<LiquidationEvent>>> {
        Box::pin(async move { Ok(self.liquidations.lock().clone()) })
    }

    fn get_lot_size<'a>(&'a self, symbol: &'a Symbol) -> BoxFuture<'a, GatewayResult<Size>> {
        Box::pin(async move {
            Ok(self
                .lot_sizes
                .lock()
                .get(symbol)
                .copied()
                .unwrap_or(Size::new(DEFAULT_LOT_SIZE)))
        })
    }
}
