//! Position monitor: the single authority for closing positions.
//!
//! Every trigger (price checks, periodic sweeps, hold-timer expiry and
//! forced liquidations) ends in [`PositionMonitor::close`].
//!
//! # Per-symbol slots
//!
//! Each symbol owns a `tokio::sync::Mutex<SymbolSlot>` in a `DashMap`. The
//! slot holds the symbol's timer handle and close phase, so:
//! - the close lock is held across the whole decide-then-act window
//! - timers are armed and cancelled only under that same lock
//!
//! The committed state lives in `PositionStore` and `TimerStore`; slots are a
//! liveness aid and are never consulted to decide whether a position is open.
//!
//! # Close sequence
//!
//! 1. Lock the slot, cancel the pending timer
//! 2. Re-verify the position is open (else `AlreadyClosed`)
//! 3. Query the exchange size; zero means already flat
//! 4. Otherwise submit a reduce order for the lot-rounded size
//! 5. Reconcile PnL from the exchange, or compute it locally
//! 6. Commit the close in `PositionStore` (conditional update)
//! 7. Notify the sinks
//! 8. Remove the timer row, whatever happened above

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use autoclose_core::{CloseReason, PositionKind, Price, Size, Symbol};
use autoclose_persistence::{
    CloseWrite, ClosedPositionRecord, ExitFields, PositionRecord, PositionStore, RestoreOutcome,
    TimerStore,
};
use autoclose_telemetry::Metrics;

use crate::error::{GatewayError, MonitorError, MonitorResult};
use crate::flatten::{plan_flatten, FlattenPlan};
use crate::gateway::{DynGateway, GatewayResult, PnlSnapshot, DEFAULT_LOT_SIZE};
use crate::pnl::{fallback_realized, unrealized_pnl_pct};
use crate::sink::{CloseNotice, LedgerSink, NotificationSink};
use crate::timer::{spawn_expiry, HoldTimer, DEFAULT_HOLD};

// ============================================================================
// MonitorConfig
// ============================================================================

/// Runtime parameters of the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Unrealized PnL (percent) at which a position is closed.
    pub target_profit_pct: Decimal,
    /// Maximum holding time.
    pub hold: Duration,
    /// How long a fetched price may be reused by `check`.
    pub price_cache_ttl: Duration,
    /// Confirmation attempts before giving up for the cycle.
    pub confirm_attempts: u32,
    /// Linear backoff step between confirmation attempts.
    pub confirm_backoff: Duration,
    /// Upper bound for any single exchange call.
    pub exchange_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_profit_pct: Decimal::TWO,
            hold: DEFAULT_HOLD,
            price_cache_ttl: Duration::from_secs(2),
            confirm_attempts: 3,
            confirm_backoff: Duration::from_millis(500),
            exchange_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Observable lifecycle state of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolState {
    NoPosition,
    /// Open position; a close deadline is (or will be) pending.
    Armed,
    /// A close is in progress under the symbol lock.
    Closing,
    /// The last close committed and nothing is open.
    Closed,
}

/// Why a check made no decision this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Price could not be fetched or was invalid.
    PriceUnavailable(GatewayError),
    /// PnL undefined (zero entry price).
    NoPnl,
}

/// Result of a price check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    NoPosition,
    Skipped(SkipReason),
    /// Below target.
    Holding { pnl_percent: Decimal },
    /// Target hit but the authoritative confirmation did not agree.
    NotConfirmed { pnl_percent: Decimal },
    Closed(CloseOutcome),
}

impl CheckOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::NoPosition => "no_position",
            Self::Skipped(_) => "skipped",
            Self::Holding { .. } => "holding",
            Self::NotConfirmed { .. } => "not_confirmed",
            Self::Closed(_) => "closed",
        }
    }
}

/// Close step that failed without mutating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStage {
    SizeQuery,
    Order,
}

impl CloseStage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SizeQuery => "size_query",
            Self::Order => "order",
        }
    }
}

/// Result of a close attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// This call committed the close.
    Closed(ClosedPositionRecord),
    /// Nothing open for `(symbol, kind)`; another trigger won.
    AlreadyClosed,
    /// Exchange step failed; the position stays open.
    Failed { stage: CloseStage, error: GatewayError },
}

impl CloseOutcome {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::Closed(_) => "closed",
            Self::AlreadyClosed => "already_closed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Exit data already known to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownExit {
    pub exit_price: Option<Price>,
    pub pnl_usd: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub fee: Option<Decimal>,
    /// Size the exchange closed, when it differs from the recorded amount.
    pub amount: Option<Size>,
    /// The exchange already closed the position; skip size query and order.
    pub settled: bool,
}

impl KnownExit {
    /// Exit settled by the exchange itself (e.g. forced liquidation).
    #[must_use]
    pub fn settled(exit_price: Price, pnl_usd: Decimal, pnl_percent: Decimal, fee: Option<Decimal>) -> Self {
        Self {
            exit_price: Some(exit_price),
            pnl_usd: Some(pnl_usd),
            pnl_percent: Some(pnl_percent),
            fee,
            amount: None,
            settled: true,
        }
    }

    #[must_use]
    pub fn with_amount(mut self, amount: Option<Size>) -> Self {
        self.amount = amount.filter(Size::is_positive);
        self
    }
}

/// Startup recovery summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Timers re-armed with their remaining hold.
    pub rearmed: Vec<Symbol>,
    /// Positions closed immediately because their hold had elapsed.
    pub expired_closed: Vec<Symbol>,
    /// Expired positions whose close did not commit (retried later).
    pub expired_failed: Vec<Symbol>,
    /// Timer rows with no open position, removed.
    pub stale_dropped: Vec<Symbol>,
    /// Open positions that had no timer row and were armed.
    pub armed_without_timer: Vec<Symbol>,
}

/// Summary of one full sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub closed: usize,
    pub skipped: usize,
    pub errors: usize,
}

// ============================================================================
// SymbolSlot
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ClosePhase {
    #[default]
    Idle,
    Closing,
    Closed,
}

#[derive(Debug, Default)]
struct SymbolSlot {
    timer: Option<JoinHandle<()>>,
    phase: ClosePhase,
}

impl SymbolSlot {
    fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Abort and drop the timer handle. Returns whether one was held.
    fn cancel_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(handle) => {
                handle.abort();
                Metrics::timer_disarmed();
                true
            }
            None => false,
        }
    }
}

struct CachedPrice {
    price: Price,
    fetched_at: Instant,
}

// ============================================================================
// PositionMonitor
// ============================================================================

/// Orchestrates checks, timers and the close state machine.
pub struct PositionMonitor {
    config: MonitorConfig,
    hold_timer: HoldTimer,
    gateway: DynGateway,
    positions: PositionStore,
    timers: TimerStore,
    notifier: Arc<dyn NotificationSink>,
    ledger: Arc<dyn LedgerSink>,
    slots: DashMap<Symbol, Arc<Mutex<SymbolSlot>>>,
    price_cache: parking_lot::Mutex<HashMap<Symbol, CachedPrice>>,
    this: Weak<PositionMonitor>,
}

impl PositionMonitor {
    /// Create a monitor. Call [`restore`](Self::restore) before feeding
    /// triggers.
    #[must_use]
    pub fn new(
        config: MonitorConfig,
        gateway: DynGateway,
        positions: PositionStore,
        timers: TimerStore,
        notifier: Arc<dyn NotificationSink>,
        ledger: Arc<dyn LedgerSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            hold_timer: HoldTimer::new(config.hold),
            config,
            gateway,
            positions,
            timers,
            notifier,
            ledger,
            slots: DashMap::new(),
            price_cache: parking_lot::Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn positions(&self) -> &PositionStore {
        &self.positions
    }

    #[must_use]
    pub fn timers(&self) -> &TimerStore {
        &self.timers
    }

    fn slot(&self, symbol: &Symbol) -> Arc<Mutex<SymbolSlot>> {
        self.slots.entry(symbol.clone()).or_default().clone()
    }

    // ------------------------------------------------------------------------
    // Exchange access
    // ------------------------------------------------------------------------

    /// Run a gateway call under the configured timeout, recording latency.
    async fn exchange<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = GatewayResult<T>>,
    ) -> GatewayResult<T> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.exchange_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                call,
                timeout_ms: self.config.exchange_timeout.as_millis() as u64,
            }),
        };
        Metrics::exchange_latency(call, started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Fetch a price from the exchange, bypassing the cache.
    async fn fresh_price(&self, symbol: &Symbol) -> GatewayResult<Price> {
        let price = self
            .exchange("get_price", self.gateway.get_price(symbol))
            .await?
            .validated()
            .map_err(|e| GatewayError::InvalidPriceData(e.to_string()))?;

        self.price_cache.lock().insert(
            symbol.clone(),
            CachedPrice {
                price,
                fetched_at: Instant::now(),
            },
        );
        Ok(price)
    }

    /// Price from the short-lived cache, refreshed when stale.
    async fn cached_price(&self, symbol: &Symbol) -> GatewayResult<Price> {
        let hit = self
            .price_cache
            .lock()
            .get(symbol)
            .filter(|c| c.fetched_at.elapsed() < self.config.price_cache_ttl)
            .map(|c| c.price);
        match hit {
            Some(price) => Ok(price),
            None => self.fresh_price(symbol).await,
        }
    }

    /// Last price seen for `symbol`, however old.
    fn last_known_price(&self, symbol: &Symbol) -> Option<Price> {
        self.price_cache.lock().get(symbol).map(|c| c.price)
    }

    async fn lot_size(&self, symbol: &Symbol) -> Size {
        match self
            .exchange("get_lot_size", self.gateway.get_lot_size(symbol))
            .await
        {
            Ok(lot) => lot,
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Lot size unavailable, using default");
                Size::new(DEFAULT_LOT_SIZE)
            }
        }
    }

    /// Size still held on the exchange for `record`.
    async fn exchange_size(&self, record: &PositionRecord) -> GatewayResult<Size> {
        match record.kind {
            PositionKind::Directional => {
                let currency = record.symbol.base_currency();
                self.exchange("get_balance", self.gateway.get_balance(currency))
                    .await
            }
            PositionKind::LeveragedShort => self
                .exchange(
                    "get_contract_position",
                    self.gateway.get_contract_position(&record.symbol),
                )
                .await
                .map(|p| p.size),
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Arm the hold timer for `record` if none is running.
    ///
    /// The persisted row is insert-if-absent, so time accrued before a
    /// restart is kept. Returns `false` if already armed or no longer open.
    async fn arm(&self, record: &PositionRecord) -> MonitorResult<bool> {
        let slot = self.slot(&record.symbol);
        let mut slot = slot.lock().await;
        if slot.timer_armed() {
            return Ok(false);
        }

        // Re-verify under the lock: a close that just committed must not
        // leave a timer row behind.
        if self
            .positions
            .lookup_open_kind(&record.symbol, record.kind)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        let now = Utc::now();
        let started_at = self.hold_timer.start_for(record.entry_time, now);
        self.timers
            .add(&record.symbol, started_at, Duration::ZERO)
            .await?;
        let delay = match self.timers.get(&record.symbol).await? {
            Some(entry) => self.hold_timer.delay_for(&entry, now),
            None => self.hold_timer.hold(),
        };

        slot.cancel_timer();
        slot.timer = Some(self.spawn_timer(record.symbol.clone(), record.kind, delay));
        slot.phase = ClosePhase::Idle;
        Metrics::timer_armed();

        debug!(
            symbol = %record.symbol,
            kind = %record.kind,
            delay_ms = delay.as_millis() as u64,
            "Hold timer armed"
        );
        Ok(true)
    }

    fn spawn_timer(&self, symbol: Symbol, kind: PositionKind, delay: Duration) -> JoinHandle<()> {
        let monitor = self.this.clone();
        let task_symbol = symbol.clone();
        spawn_expiry(symbol, delay, move || async move {
            let Some(monitor) = monitor.upgrade() else {
                return;
            };
            match monitor
                .close(&task_symbol, kind, CloseReason::Timeout, None)
                .await
            {
                Ok(outcome) => debug!(
                    symbol = %task_symbol,
                    outcome = outcome.metric_label(),
                    "Timer close finished"
                ),
                Err(e) => error!(symbol = %task_symbol, error = %e, "Timer close failed"),
            }
        })
    }

    async fn remove_timer_row(&self, symbol: &Symbol) {
        if let Err(e) = self.timers.remove(symbol).await {
            Metrics::close_failure("timer_remove");
            error!(symbol = %symbol, error = %e, "Failed to remove timer row");
        }
    }

    // ------------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------------

    /// Open notification: arm the hold timer for the newly opened position.
    ///
    /// Returns `false` if no open position exists for `symbol` or a timer is
    /// already running.
    pub async fn on_position_opened(&self, symbol: &Symbol) -> MonitorResult<bool> {
        match self.positions.lookup_open(symbol).await? {
            Some(record) => {
                let armed = self.arm(&record).await?;
                if armed {
                    info!(symbol = %symbol, kind = %record.kind, "Position armed");
                }
                Ok(armed)
            }
            None => {
                warn!(symbol = %symbol, "Open notification without an open position");
                Ok(false)
            }
        }
    }

    /// Evaluate the close conditions for `symbol`.
    ///
    /// `price` is fetched through the cache when absent. A target hit must be
    /// confirmed by the exchange before the position is closed.
    pub async fn check(&self, symbol: &Symbol, price: Option<Price>) -> MonitorResult<CheckOutcome> {
        let outcome = self.check_inner(symbol, price).await;
        if let Ok(outcome) = &outcome {
            Metrics::price_check(outcome.metric_label());
        }
        outcome
    }

    async fn check_inner(&self, symbol: &Symbol, price: Option<Price>) -> MonitorResult<CheckOutcome> {
        let Some(record) = self.positions.lookup_open(symbol).await? else {
            return Ok(CheckOutcome::NoPosition);
        };

        let price = match price {
            Some(p) => p
                .validated()
                .map_err(|e| GatewayError::InvalidPriceData(e.to_string())),
            None => self.cached_price(symbol).await,
        };
        let price = match price {
            Ok(p) => p,
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Price unavailable, skipping cycle");
                return Ok(CheckOutcome::Skipped(SkipReason::PriceUnavailable(e)));
            }
        };

        let Some(pnl) =
            unrealized_pnl_pct(record.kind, record.entry_price, price, record.leverage)
        else {
            return Ok(CheckOutcome::Skipped(SkipReason::NoPnl));
        };

        if pnl >= self.config.target_profit_pct {
            if self.confirm_target(&record).await {
                info!(
                    symbol = %symbol,
                    pnl_percent = %pnl,
                    target = %self.config.target_profit_pct,
                    "Profit target confirmed, closing"
                );
                let outcome = self
                    .close(symbol, record.kind, CloseReason::Target, None)
                    .await?;
                return Ok(CheckOutcome::Closed(outcome));
            }
            info!(symbol = %symbol, pnl_percent = %pnl, "Profit target not confirmed");
            self.arm(&record).await?;
            return Ok(CheckOutcome::NotConfirmed { pnl_percent: pnl });
        }

        self.arm(&record).await?;
        Ok(CheckOutcome::Holding { pnl_percent: pnl })
    }

    /// Authoritative re-check of a target hit.
    ///
    /// Leveraged positions use the exchange's live unrealized PnL; directional
    /// positions re-evaluate against a freshly fetched price. Retries with
    /// linear backoff, then gives up for this cycle.
    async fn confirm_target(&self, record: &PositionRecord) -> bool {
        let attempts = self.config.confirm_attempts.max(1);
        for attempt in 1..=attempts {
            let confirmed = match record.kind {
                PositionKind::LeveragedShort => self
                    .exchange(
                        "get_unrealized_pnl",
                        self.gateway.get_unrealized_pnl(&record.symbol),
                    )
                    .await
                    .map(|snap| snap.pnl_percent),
                PositionKind::Directional => {
                    self.fresh_price(&record.symbol).await.and_then(|price| {
                        unrealized_pnl_pct(record.kind, record.entry_price, price, record.leverage)
                            .ok_or_else(|| GatewayError::InvalidPriceData("zero entry".into()))
                    })
                }
            };

            match confirmed {
                Ok(pnl) => {
                    debug!(
                        symbol = %record.symbol,
                        attempt,
                        pnl_percent = %pnl,
                        "Target confirmation"
                    );
                    return pnl >= self.config.target_profit_pct;
                }
                Err(e) => {
                    warn!(
                        symbol = %record.symbol,
                        attempt,
                        error = %e,
                        "Target confirmation unavailable"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.confirm_backoff * attempt).await;
                    }
                }
            }
        }
        false
    }

    /// Close the open `(symbol, kind)` position.
    ///
    /// Idempotent: concurrent callers serialise on the symbol lock and all
    /// but the first observe `AlreadyClosed`. The timer row is removed on
    /// every path. Only a failed commit is returned as an error.
    pub async fn close(
        &self,
        symbol: &Symbol,
        kind: PositionKind,
        reason: CloseReason,
        known: Option<KnownExit>,
    ) -> MonitorResult<CloseOutcome> {
        let slot = self.slot(symbol);
        let mut slot = slot.lock().await;
        slot.cancel_timer();
        slot.phase = ClosePhase::Closing;

        let result = self.close_locked(symbol, kind, reason, known).await;

        slot.phase = match &result {
            Ok(CloseOutcome::Closed(_)) | Ok(CloseOutcome::AlreadyClosed) => ClosePhase::Closed,
            _ => ClosePhase::Idle,
        };
        self.remove_timer_row(symbol).await;

        match &result {
            Ok(outcome) => Metrics::close_attempt(reason.as_str(), outcome.metric_label()),
            Err(_) => Metrics::close_attempt(reason.as_str(), "error"),
        }
        result
    }

    async fn close_locked(
        &self,
        symbol: &Symbol,
        kind: PositionKind,
        reason: CloseReason,
        known: Option<KnownExit>,
    ) -> MonitorResult<CloseOutcome> {
        let Some(record) = self.positions.lookup_open_kind(symbol, kind).await? else {
            debug!(symbol = %symbol, kind = %kind, "Close skipped, nothing open");
            return Ok(CloseOutcome::AlreadyClosed);
        };
        let known = known.unwrap_or_default();

        // Flatten on the exchange unless it already settled the position.
        let mut order_id = None;
        let mut flatten_skipped = true;
        if !known.settled {
            let size = match self.exchange_size(&record).await {
                Ok(size) => size,
                Err(e) => return Ok(self.close_failed(&record, CloseStage::SizeQuery, e)),
            };
            let lot = self.lot_size(symbol).await;

            match plan_flatten(symbol, kind, size, lot) {
                FlattenPlan::AlreadyFlat { reported } => {
                    info!(
                        symbol = %symbol,
                        kind = %kind,
                        reported = %reported,
                        "Exchange reports no size, skipping order"
                    );
                }
                FlattenPlan::Submit(request) => {
                    match self
                        .exchange("place_reduce_order", self.gateway.place_reduce_order(&request))
                        .await
                    {
                        Ok(ack) => {
                            info!(
                                symbol = %symbol,
                                side = %request.side,
                                size = %request.size,
                                order_id = %ack.order_id,
                                "Reduce order accepted"
                            );
                            order_id = Some(ack.order_id);
                            flatten_skipped = false;
                        }
                        Err(GatewayError::InsufficientBalance(detail)) => {
                            info!(
                                symbol = %symbol,
                                detail = %detail,
                                "Insufficient balance, treating as already flat"
                            );
                        }
                        Err(e) => return Ok(self.close_failed(&record, CloseStage::Order, e)),
                    }
                }
            }
        }

        let reconciled = self.reconcile(&record, &known).await;
        let exit_time = Utc::now();
        let exit = ExitFields {
            exit_price: reconciled.exit_price,
            exit_time,
            pnl_usd: reconciled.pnl_usd,
            pnl_percent: reconciled.pnl_percent,
            fee: reconciled.fee,
            order_id: order_id.clone(),
            amount: known.amount,
        };

        match self.positions.close(symbol, kind, exit, reason).await {
            Ok(CloseWrite::Committed) => {}
            Ok(CloseWrite::NoOp) => {
                warn!(symbol = %symbol, kind = %kind, "Close lost the race at commit");
                return Ok(CloseOutcome::AlreadyClosed);
            }
            Err(e) => {
                Metrics::close_failure("commit");
                error!(symbol = %symbol, kind = %kind, error = %e, "Failed to commit close");
                return Err(MonitorError::Persistence(e));
            }
        }

        let record = ClosedPositionRecord {
            symbol: symbol.clone(),
            kind,
            entry_price: record.entry_price,
            exit_price: reconciled.exit_price,
            entry_time: record.entry_time,
            exit_time,
            amount: known.amount.unwrap_or(record.amount),
            leverage: record.leverage,
            pnl_usd: reconciled.pnl_usd,
            pnl_percent: reconciled.pnl_percent,
            fee: reconciled.fee,
            reason: Some(reason),
            order_id: order_id.or(record.order_id),
            flatten_skipped,
        };

        info!(
            symbol = %symbol,
            kind = %kind,
            reason = %reason,
            exit_price = %record.exit_price,
            pnl_percent = %record.pnl_percent,
            pnl_usd = %record.pnl_usd,
            "Position closed"
        );

        self.notify(&record).await;
        Ok(CloseOutcome::Closed(record))
    }

    fn close_failed(&self, record: &PositionRecord, stage: CloseStage, error: GatewayError) -> CloseOutcome {
        Metrics::close_failure(stage.as_str());
        warn!(
            symbol = %record.symbol,
            kind = %record.kind,
            stage = stage.as_str(),
            error = %error,
            "Close failed, position stays open"
        );
        CloseOutcome::Failed { stage, error }
    }

    /// Exit price and PnL for `record`, best source first.
    async fn reconcile(&self, record: &PositionRecord, known: &KnownExit) -> Reconciled {
        if let (Some(exit_price), Some(pnl_usd), Some(pnl_percent)) =
            (known.exit_price, known.pnl_usd, known.pnl_percent)
        {
            return Reconciled {
                exit_price,
                pnl_usd,
                pnl_percent,
                fee: known.fee,
            };
        }

        let history: Option<PnlSnapshot> = if record.kind == PositionKind::LeveragedShort {
            match self
                .exchange("get_realized_pnl", self.gateway.get_realized_pnl(&record.symbol))
                .await
            {
                Ok(snap) => Some(snap),
                Err(e) => {
                    warn!(symbol = %record.symbol, error = %e, "Realized PnL unavailable, computing locally");
                    None
                }
            }
        } else {
            None
        };

        let exit_price = match known.exit_price.or(history.as_ref().and_then(|h| h.exit_price)) {
            Some(price) => price,
            None => self.exit_price_estimate(record).await,
        };

        match history {
            Some(snap) => Reconciled {
                exit_price,
                pnl_usd: snap.pnl_usd,
                pnl_percent: snap.pnl_percent,
                fee: snap.fee.or(known.fee),
            },
            None => {
                let (pnl_usd, pnl_percent) = fallback_realized(
                    record.kind,
                    record.entry_price,
                    exit_price,
                    known.amount.unwrap_or(record.amount),
                    record.leverage,
                );
                Reconciled {
                    exit_price,
                    pnl_usd,
                    pnl_percent,
                    fee: known.fee,
                }
            }
        }
    }

    /// Fresh price, else the last cached one, else the entry price.
    async fn exit_price_estimate(&self, record: &PositionRecord) -> Price {
        match self.fresh_price(&record.symbol).await {
            Ok(price) => price,
            Err(e) => {
                let fallback = self
                    .last_known_price(&record.symbol)
                    .unwrap_or(record.entry_price);
                warn!(
                    symbol = %record.symbol,
                    error = %e,
                    fallback = %fallback,
                    "Exit price unavailable, using fallback"
                );
                fallback
            }
        }
    }

    async fn notify(&self, record: &ClosedPositionRecord) {
        let notice = CloseNotice::from(record);
        if let Err(e) = self.notifier.position_closed(&notice).await {
            Metrics::close_failure("notify");
            warn!(symbol = %record.symbol, error = %e, "Close notification failed");
        }
        if let Err(e) = self.ledger.record_closed_position(record).await {
            Metrics::close_failure("ledger");
            warn!(symbol = %record.symbol, error = %e, "Ledger write failed");
        }
    }

    /// Startup recovery. Must complete before any trigger is accepted.
    ///
    /// Replays the timer store: expired timers close immediately with
    /// `reason=timeout`, the rest are re-armed with their remaining hold.
    /// Timer rows without an open position are dropped, and open positions
    /// without a timer are armed.
    pub async fn restore(&self) -> MonitorResult<RestoreReport> {
        let now = Utc::now();
        let open = self.positions.list_open().await?;
        let restored = self.timers.restore(now, self.hold_timer.hold()).await?;

        // `list_open` is oldest first, so `last()` is the row `lookup_open`
        // returns: the timer follows the newest open kind on every path.
        let mut open_by_symbol: HashMap<Symbol, Vec<PositionRecord>> = HashMap::new();
        for record in open {
            open_by_symbol
                .entry(record.symbol.clone())
                .or_default()
                .push(record);
        }

        let mut report = RestoreReport::default();
        let mut with_timer = HashSet::new();

        for timer in restored {
            let symbol = timer.entry.symbol.clone();
            let Some(records) = open_by_symbol.get(&symbol) else {
                self.timers.remove(&symbol).await?;
                info!(symbol = %symbol, "Dropped timer without open position");
                report.stale_dropped.push(symbol);
                continue;
            };
            with_timer.insert(symbol.clone());

            match timer.outcome {
                RestoreOutcome::Expired => {
                    info!(
                        symbol = %symbol,
                        elapsed_s = timer.total_elapsed.as_secs(),
                        "Hold elapsed while offline, closing"
                    );
                    let mut closed = false;
                    for record in records {
                        let outcome = self
                            .close(&symbol, record.kind, CloseReason::Timeout, None)
                            .await?;
                        closed |= outcome.is_closed();
                    }
                    if closed {
                        report.expired_closed.push(symbol);
                    } else {
                        report.expired_failed.push(symbol);
                    }
                }
                RestoreOutcome::Rearm(remaining) => {
                    self.timers
                        .update_elapsed(&symbol, timer.total_elapsed)
                        .await?;
                    if let Some(record) = records.last() {
                        self.arm(record).await?;
                    }
                    info!(
                        symbol = %symbol,
                        remaining_s = remaining.as_secs(),
                        "Timer restored"
                    );
                    report.rearmed.push(symbol);
                }
            }
        }

        for (symbol, records) in &open_by_symbol {
            if with_timer.contains(symbol) {
                continue;
            }
            if let Some(record) = records.last() {
                if self.arm(record).await? {
                    report.armed_without_timer.push(symbol.clone());
                }
            }
        }

        info!(
            rearmed = report.rearmed.len(),
            expired_closed = report.expired_closed.len(),
            expired_failed = report.expired_failed.len(),
            stale_dropped = report.stale_dropped.len(),
            armed_without_timer = report.armed_without_timer.len(),
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Full reconciliation poll: check every open position concurrently.
    ///
    /// Per-symbol errors are logged and counted, never propagated.
    pub async fn sweep(&self) -> MonitorResult<SweepReport> {
        let mut symbols: Vec<Symbol> = self
            .positions
            .list_open()
            .await?
            .into_iter()
            .map(|r| r.symbol)
            .collect();
        symbols.sort();
        symbols.dedup();

        let results = join_all(symbols.iter().map(|s| self.check(s, None))).await;

        let mut report = SweepReport {
            checked: symbols.len(),
            ..SweepReport::default()
        };
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(CheckOutcome::Closed(outcome)) if outcome.is_closed() => report.closed += 1,
                Ok(CheckOutcome::Skipped(_)) => report.skipped += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(symbol = %symbol, error = %e, "Check failed during sweep");
                }
            }
        }
        debug!(?report, "Sweep complete");
        Ok(report)
    }

    /// Cancel every in-memory timer without closing anything.
    ///
    /// Persisted timer rows are kept for the next restore. Returns the
    /// number of timers cancelled.
    pub async fn stop_all(&self) -> usize {
        let slots: Vec<(Symbol, Arc<Mutex<SymbolSlot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut stopped = 0;
        for (symbol, slot) in slots {
            if slot.lock().await.cancel_timer() {
                debug!(symbol = %symbol, "Timer stopped");
                stopped += 1;
            }
        }
        info!(stopped, "All timers stopped");
        stopped
    }

    /// Lifecycle state of `symbol`.
    pub async fn state(&self, symbol: &Symbol) -> MonitorResult<SymbolState> {
        let slot = self.slots.get(symbol).map(|s| s.value().clone());
        let phase = match &slot {
            Some(slot) => match slot.try_lock() {
                Ok(guard) if guard.timer_armed() => return Ok(SymbolState::Armed),
                Ok(guard) => guard.phase,
                Err(_) => return Ok(SymbolState::Closing),
            },
            None => ClosePhase::Idle,
        };

        if self.positions.lookup_open(symbol).await?.is_some() {
            return Ok(SymbolState::Armed);
        }
        Ok(match phase {
            ClosePhase::Closed => SymbolState::Closed,
            ClosePhase::Closing => SymbolState::Closing,
            ClosePhase::Idle => SymbolState::NoPosition,
        })
    }

    /// Number of timers currently running.
    pub fn armed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.value().try_lock().map(|s| s.timer_armed()).unwrap_or(false))
            .count()
    }
}

struct Reconciled {
    exit_price: Price,
    pnl_usd: Decimal,
    pnl_percent: Decimal,
    fee: Option<Decimal>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperExchange;
    use crate::sink::MemorySink;
    use autoclose_core::OrderSide;
    use autoclose_persistence::NewPosition;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    struct Harness {
        monitor: Arc<PositionMonitor>,
        paper: Arc<PaperExchange>,
        sink: Arc<MemorySink>,
        positions: PositionStore,
        timers: TimerStore,
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            target_profit_pct: dec!(20),
            hold: Duration::from_secs(180),
            price_cache_ttl: Duration::from_secs(60),
            confirm_attempts: 2,
            confirm_backoff: Duration::from_millis(5),
            exchange_timeout: Duration::from_millis(200),
        }
    }

    fn harness(config: MonitorConfig) -> Harness {
        let paper = Arc::new(PaperExchange::new());
        let sink = Arc::new(MemorySink::new());
        let positions = PositionStore::open_in_memory().unwrap();
        let timers = TimerStore::open_in_memory().unwrap();
        let monitor = PositionMonitor::new(
            config,
            paper.clone(),
            positions.clone(),
            timers.clone(),
            sink.clone(),
            sink.clone(),
        );
        Harness {
            monitor,
            paper,
            sink,
            positions,
            timers,
        }
    }

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    async fn open_directional(h: &Harness, symbol: &Symbol, entry: Decimal, amount: Decimal) {
        h.positions
            .open_position(
                symbol,
                PositionKind::Directional,
                NewPosition::new(Price::new(entry), Size::new(amount)),
            )
            .await
            .unwrap();
        h.paper.set_balance(symbol.base_currency(), Size::new(amount));
    }

    async fn open_short(h: &Harness, symbol: &Symbol, entry: Decimal, amount: Decimal, lev: Decimal) {
        h.positions
            .open_position(
                symbol,
                PositionKind::LeveragedShort,
                NewPosition::new(Price::new(entry), Size::new(amount)).with_leverage(lev),
            )
            .await
            .unwrap();
        h.paper.set_contract(symbol, Size::new(amount), OrderSide::Sell);
    }

    async fn wait_for<F, Fut>(mut f: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if f().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_check_below_target_arms_timer() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;

        let outcome = assert_ok!(h.monitor.check(&btc, Some(Price::new(dec!(110)))).await);
        assert_eq!(outcome, CheckOutcome::Holding { pnl_percent: dec!(10) });
        assert!(h.timers.has(&btc).await.unwrap());
        assert_eq!(h.monitor.state(&btc).await.unwrap(), SymbolState::Armed);
        assert_eq!(h.monitor.armed_count(), 1);
    }

    #[tokio::test]
    async fn test_check_confirmed_target_closes_directional() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(0.5)).await;
        h.paper.set_price(&btc, Price::new(dec!(120)));

        let outcome = assert_ok!(h.monitor.check(&btc, None).await);
        let CheckOutcome::Closed(CloseOutcome::Closed(record)) = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(record.reason, Some(CloseReason::Target));
        assert_eq!(record.exit_price, Price::new(dec!(120)));
        assert_eq!(record.pnl_percent, dec!(20));
        assert_eq!(record.pnl_usd, dec!(10));

        let orders = h.paper.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].size, Size::new(dec!(0.5)));

        assert!(h.positions.lookup_open(&btc).await.unwrap().is_none());
        assert!(!h.timers.has(&btc).await.unwrap());
        assert_eq!(h.sink.notices().len(), 1);
        assert_eq!(h.sink.records().len(), 1);
        assert_eq!(h.monitor.state(&btc).await.unwrap(), SymbolState::Closed);
    }

    #[tokio::test]
    async fn test_target_hit_but_confirmation_below_target_keeps_position() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        // Tick says +25%, the fresh price says +5%.
        h.paper.set_price(&btc, Price::new(dec!(105)));

        let outcome = h.monitor.check(&btc, Some(Price::new(dec!(125)))).await.unwrap();
        assert_eq!(outcome, CheckOutcome::NotConfirmed { pnl_percent: dec!(25) });
        assert!(h.positions.lookup_open(&btc).await.unwrap().is_some());
        assert!(h.timers.has(&btc).await.unwrap());
        assert!(h.paper.orders().is_empty());
    }

    #[tokio::test]
    async fn test_leveraged_confirmation_uses_unrealized_pnl() {
        let h = harness(config());
        let eth = sym("ETH-USDT-SWAP");
        open_short(&h, &eth, dec!(100), dec!(3), dec!(4)).await;

        // First confirmation attempt fails, second agrees.
        h.paper
            .push_unrealized_pnl(&eth, Err(GatewayError::Unavailable("busy".into())));
        h.paper.push_unrealized_pnl(
            &eth,
            Ok(PnlSnapshot {
                pnl_usd: dec!(30),
                pnl_percent: dec!(40),
                fee: None,
                exit_price: None,
            }),
        );
        h.paper.set_realized_pnl(
            &eth,
            PnlSnapshot {
                pnl_usd: dec!(29.5),
                pnl_percent: dec!(39.3),
                fee: Some(dec!(0.5)),
                exit_price: Some(Price::new(dec!(90.1))),
            },
        );

        let outcome = h.monitor.check(&eth, Some(Price::new(dec!(90)))).await.unwrap();
        let CheckOutcome::Closed(CloseOutcome::Closed(record)) = outcome else {
            panic!("expected close, got {outcome:?}");
        };
        assert_eq!(record.pnl_usd, dec!(29.5));
        assert_eq!(record.pnl_percent, dec!(39.3));
        assert_eq!(record.exit_price, Price::new(dec!(90.1)));
        assert_eq!(record.fee, Some(dec!(0.5)));

        let orders = h.paper.orders();
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].size, Size::new(dec!(3)));
    }

    #[tokio::test]
    async fn test_confirmation_unavailable_is_not_confirmed() {
        let h = harness(config());
        let eth = sym("ETH-USDT-SWAP");
        open_short(&h, &eth, dec!(100), dec!(1), dec!(4)).await;

        let outcome = h.monitor.check(&eth, Some(Price::new(dec!(90)))).await.unwrap();
        assert_eq!(outcome, CheckOutcome::NotConfirmed { pnl_percent: dec!(40) });
        assert!(h.positions.lookup_open(&eth).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_price_failure_skips_cycle() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper
            .set_price_error(Some(GatewayError::Unavailable("down".into())));

        let outcome = h.monitor.check(&btc, None).await.unwrap();
        assert!(matches!(
            outcome,
            CheckOutcome::Skipped(SkipReason::PriceUnavailable(_))
        ));
        assert!(!h.timers.has(&btc).await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_price_times_out() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(101)));
        h.paper.set_price_delay(Some(Duration::from_secs(5)));

        let outcome = h.monitor.check(&btc, None).await.unwrap();
        assert!(matches!(
            outcome,
            CheckOutcome::Skipped(SkipReason::PriceUnavailable(GatewayError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_price_cache_reuses_recent_price() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(101)));

        h.monitor.check(&btc, None).await.unwrap();
        h.monitor.check(&btc, None).await.unwrap();
        assert_eq!(h.paper.price_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_closes_commit_once() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(110)));

        let a = {
            let m = h.monitor.clone();
            let s = btc.clone();
            tokio::spawn(async move {
                m.close(&s, PositionKind::Directional, CloseReason::Timeout, None)
                    .await
            })
        };
        let b = {
            let m = h.monitor.clone();
            let s = btc.clone();
            tokio::spawn(async move {
                m.close(&s, PositionKind::Directional, CloseReason::Target, None)
                    .await
            })
        };

        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let closed = outcomes.iter().filter(|o| o.is_closed()).count();
        let already = outcomes
            .iter()
            .filter(|o| matches!(o, CloseOutcome::AlreadyClosed))
            .count();
        assert_eq!(closed, 1);
        assert_eq!(already, 1);
        assert_eq!(h.paper.orders().len(), 1);
        assert_eq!(h.positions.list_closed(10).await.unwrap().len(), 1);
        assert_eq!(h.sink.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_balance_close_skips_order_with_fallback_pnl() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(2)).await;
        h.paper.set_balance("BTC", Size::ZERO);
        h.paper.set_price(&btc, Price::new(dec!(90)));

        let outcome = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        let CloseOutcome::Closed(record) = outcome else {
            panic!("expected close");
        };
        assert!(record.flatten_skipped);
        assert!(h.paper.orders().is_empty());
        assert_eq!(record.pnl_usd, dec!(-20));
        assert_eq!(record.pnl_percent, dec!(-10));

        let closed = h.positions.list_closed(1).await.unwrap();
        assert_eq!(closed[0].reason, Some(CloseReason::Timeout));
        assert_eq!(closed[0].pnl_usd, Some(dec!(-20)));
    }

    #[tokio::test]
    async fn test_dust_balance_rounds_to_flat() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_balance("BTC", Size::new(dec!(0.0004)));
        h.paper.set_lot_size(&btc, Size::new(dec!(0.001)));
        h.paper.set_price(&btc, Price::new(dec!(100)));

        let outcome = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert!(outcome.is_closed());
        assert!(h.paper.orders().is_empty());
    }

    #[tokio::test]
    async fn test_lot_rounding_floors_order_size() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_balance("BTC", Size::new(dec!(1.23456789)));
        h.paper.set_price(&btc, Price::new(dec!(100)));

        h.monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert_eq!(h.paper.orders()[0].size, Size::new(dec!(1.234567)));
    }

    #[tokio::test]
    async fn test_insufficient_balance_treated_as_flat() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(100)));
        h.paper
            .fail_next_order(GatewayError::InsufficientBalance("0 available".into()));

        let outcome = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert!(outcome.is_closed());
        assert!(h.positions.lookup_open(&btc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_order_rejection_keeps_position_open_without_timer() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.monitor.on_position_opened(&btc).await.unwrap();
        assert!(h.timers.has(&btc).await.unwrap());
        h.paper.fail_next_order(GatewayError::Rejected("halted".into()));

        let outcome = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CloseOutcome::Failed { stage: CloseStage::Order, .. }
        ));
        assert!(h.positions.lookup_open(&btc).await.unwrap().is_some());
        assert!(!h.timers.has(&btc).await.unwrap());
        assert!(h.sink.notices().is_empty());

        // Retryable: the next close succeeds.
        h.paper.set_price(&btc, Price::new(dec!(100)));
        let retry = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert!(retry.is_closed());
    }

    #[tokio::test]
    async fn test_failed_close_rearms_on_next_check_and_fires_at_once() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        h.positions
            .open_position(
                &btc,
                PositionKind::Directional,
                NewPosition::new(Price::new(dec!(100)), Size::new(dec!(1)))
                    .with_entry_time(Utc::now() - chrono::Duration::seconds(200)),
            )
            .await
            .unwrap();
        h.paper.set_balance("BTC", Size::new(dec!(1)));
        h.paper.set_price(&btc, Price::new(dec!(101)));
        h.paper.fail_next_order(GatewayError::Rejected("halted".into()));

        let first = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert!(matches!(first, CloseOutcome::Failed { stage: CloseStage::Order, .. }));
        assert!(!h.timers.has(&btc).await.unwrap());

        // Below target: the check re-arms from entry time, already past the hold.
        let outcome = assert_ok!(h.monitor.check(&btc, None).await);
        assert_eq!(outcome, CheckOutcome::Holding { pnl_percent: dec!(1) });

        let positions = h.positions.clone();
        let symbol = btc.clone();
        assert!(
            wait_for(|| {
                let positions = positions.clone();
                let symbol = symbol.clone();
                async move { positions.lookup_open(&symbol).await.unwrap().is_none() }
            })
            .await
        );

        let closed = h.positions.list_closed(1).await.unwrap();
        assert_eq!(closed[0].reason, Some(CloseReason::Timeout));
        assert_eq!(h.paper.orders().len(), 1);
        assert!(
            wait_for(|| {
                let timers = h.timers.clone();
                let symbol = btc.clone();
                async move { !timers.has(&symbol).await.unwrap() }
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_roll_back() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(100)));
        h.sink.set_failing(true);

        let outcome = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert!(outcome.is_closed());
        assert!(h.positions.lookup_open(&btc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timer_expiry_closes_with_timeout() {
        let h = harness(MonitorConfig {
            hold: Duration::from_millis(100),
            ..config()
        });
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(101)));

        assert!(h.monitor.on_position_opened(&btc).await.unwrap());
        assert!(h.timers.has(&btc).await.unwrap());

        let positions = h.positions.clone();
        let symbol = btc.clone();
        assert!(
            wait_for(|| {
                let positions = positions.clone();
                let symbol = symbol.clone();
                async move { positions.lookup_open(&symbol).await.unwrap().is_none() }
            })
            .await
        );

        let closed = h.positions.list_closed(1).await.unwrap();
        assert_eq!(closed[0].reason, Some(CloseReason::Timeout));
        assert!(
            wait_for(|| {
                let timers = h.timers.clone();
                let symbol = btc.clone();
                async move { !timers.has(&symbol).await.unwrap() }
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_stop_all_keeps_rows() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        let eth = sym("ETH-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        open_directional(&h, &eth, dec!(10), dec!(1)).await;
        h.monitor.on_position_opened(&btc).await.unwrap();
        h.monitor.on_position_opened(&eth).await.unwrap();

        assert_eq!(h.monitor.stop_all().await, 2);
        assert_eq!(h.monitor.armed_count(), 0);
        assert_eq!(h.timers.list_all().await.unwrap().len(), 2);
        assert_eq!(h.positions.list_open().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_closes_expired_and_rearms_rest() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        let eth = sym("ETH-USDT");
        let sol = sym("SOL-USDT");
        let doge = sym("DOGE-USDT");

        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        open_directional(&h, &eth, dec!(10), dec!(1)).await;
        open_directional(&h, &doge, dec!(1), dec!(1)).await;
        // BTC was already sold on the exchange while offline.
        h.paper.set_balance("BTC", Size::ZERO);
        h.paper.set_price(&btc, Price::new(dec!(100)));

        let now = Utc::now();
        h.timers.add(&btc, now, Duration::from_secs(200)).await.unwrap();
        h.timers.add(&eth, now, Duration::from_secs(60)).await.unwrap();
        h.timers.add(&sol, now, Duration::from_secs(10)).await.unwrap();

        let report = assert_ok!(h.monitor.restore().await);
        assert_eq!(report.expired_closed, vec![btc.clone()]);
        assert_eq!(report.rearmed, vec![eth.clone()]);
        assert_eq!(report.stale_dropped, vec![sol.clone()]);
        assert_eq!(report.armed_without_timer, vec![doge.clone()]);

        let closed = h.positions.list_closed(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, Some(CloseReason::Timeout));
        assert!(h.paper.orders().is_empty());
        assert!(!h.timers.has(&btc).await.unwrap());
        assert!(!h.timers.has(&sol).await.unwrap());

        let eth_timer = h.timers.get(&eth).await.unwrap().unwrap();
        assert!(eth_timer.elapsed >= Duration::from_secs(60));
        assert_eq!(h.monitor.state(&eth).await.unwrap(), SymbolState::Armed);
        assert_eq!(h.monitor.armed_count(), 2);
    }

    #[tokio::test]
    async fn test_restore_arms_newest_kind_like_check() {
        let h = harness(MonitorConfig {
            hold: Duration::from_millis(100),
            ..config()
        });
        let btc = sym("BTC-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        open_short(&h, &btc, dec!(100), dec!(1), dec!(2)).await;
        h.paper.set_price(&btc, Price::new(dec!(100)));

        let newest = h.positions.lookup_open(&btc).await.unwrap().unwrap();
        assert_eq!(newest.kind, PositionKind::LeveragedShort);

        let report = assert_ok!(h.monitor.restore().await);
        assert_eq!(report.armed_without_timer, vec![btc.clone()]);

        let positions = h.positions.clone();
        let symbol = btc.clone();
        assert!(
            wait_for(|| {
                let positions = positions.clone();
                let symbol = symbol.clone();
                async move {
                    positions
                        .lookup_open_kind(&symbol, PositionKind::LeveragedShort)
                        .await
                        .unwrap()
                        .is_none()
                }
            })
            .await
        );
        assert!(h
            .positions
            .lookup_open_kind(&btc, PositionKind::Directional)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sweep_checks_every_open_position() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        let eth = sym("ETH-USDT");
        open_directional(&h, &btc, dec!(100), dec!(1)).await;
        open_directional(&h, &eth, dec!(10), dec!(1)).await;
        h.paper.set_price(&btc, Price::new(dec!(130)));
        h.paper
            .set_price(&eth, Price::new(dec!(10.5)));

        let report = h.monitor.sweep().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.closed, 1);
        assert!(h.positions.lookup_open(&btc).await.unwrap().is_none());
        assert!(h.timers.has(&eth).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_without_position_is_noop() {
        let h = harness(config());
        let btc = sym("BTC-USDT");
        h.timers.add(&btc, Utc::now(), Duration::ZERO).await.unwrap();

        let outcome = h
            .monitor
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();
        assert_eq!(outcome, CloseOutcome::AlreadyClosed);
        assert!(!h.timers.has(&btc).await.unwrap());
        assert_eq!(h.monitor.state(&btc).await.unwrap(), SymbolState::Closed);
        assert_eq!(
            h.monitor.check(&btc, None).await.unwrap(),
            CheckOutcome::NoPosition
        );
    }
}
