//! Forced-liquidation reconciliation.
//!
//! The exchange may liquidate a leveraged short on its own. The reconciler
//! pulls those events (or receives them from a feed via [`ingest`]) and closes
//! the matching open position through [`PositionMonitor::close`] with the
//! settled exit data, so no reduce order is sent.
//!
//! [`ingest`]: LiquidationReconciler::ingest

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use autoclose_core::{CloseReason, PositionKind, Symbol};
use autoclose_persistence::PositionStore;
use autoclose_telemetry::Metrics;

use crate::error::{GatewayError, MonitorError, MonitorResult};
use crate::gateway::{DynGateway, LiquidationEvent};
use crate::monitor::{CloseOutcome, KnownExit, PositionMonitor};

/// Reconciler parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidationConfig {
    /// Minimum time between two non-forced checks.
    pub min_interval: Duration,
    /// How far back each pull looks.
    pub lookback: Duration,
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
            lookback: Duration::from_secs(300),
        }
    }
}

/// Per-batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiquidationSummary {
    /// Events received.
    pub fetched: usize,
    /// Events not seen before.
    pub new: usize,
    /// Events that closed an open position.
    pub applied: usize,
    /// New events with no open leveraged position.
    pub unmatched: usize,
    pub duplicates: usize,
    pub malformed: usize,
    /// Events whose close failed; retried on the next pull.
    pub failed: usize,
}

/// Result of [`LiquidationReconciler::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidationCheck {
    /// Rate-limited; the next check is allowed after `next_in`.
    Skipped { next_in: Duration },
    Completed(LiquidationSummary),
}

/// Applies exchange-reported liquidations to the local state.
pub struct LiquidationReconciler {
    config: LiquidationConfig,
    gateway: DynGateway,
    monitor: Arc<PositionMonitor>,
    positions: PositionStore,
    /// Process-lifetime de-duplication set, keyed `instrument:timestamp`.
    seen: Mutex<HashSet<String>>,
    last_check: Mutex<Option<Instant>>,
}

impl LiquidationReconciler {
    pub fn new(config: LiquidationConfig, gateway: DynGateway, monitor: Arc<PositionMonitor>) -> Self {
        let positions = monitor.positions().clone();
        Self {
            config,
            gateway,
            monitor,
            positions,
            seen: Mutex::new(HashSet::new()),
            last_check: Mutex::new(None),
        }
    }

    /// Number of events processed so far.
    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Pull recent liquidations and apply them.
    ///
    /// Rate-limited to one pull per `min_interval` unless `force` is set. A
    /// failed pull does not consume the interval.
    pub async fn check(&self, force: bool) -> MonitorResult<LiquidationCheck> {
        if !force {
            if let Some(next_in) = self.rate_limited() {
                debug!(next_in_ms = next_in.as_millis() as u64, "Liquidation check rate-limited");
                return Ok(LiquidationCheck::Skipped { next_in });
            }
        }

        let timeout = self.monitor.config().exchange_timeout;
        let fetched = tokio::time::timeout(
            timeout,
            self.gateway.get_forced_liquidations(self.config.lookback),
        )
        .await
        .unwrap_or(Err(GatewayError::Timeout {
            call: "get_forced_liquidations",
            timeout_ms: timeout.as_millis() as u64,
        }));

        let events = match fetched {
            Ok(events) => events,
            Err(e) => {
                Metrics::liquidation("fetch_failed");
                warn!(error = %e, "Failed to fetch forced liquidations");
                return Err(MonitorError::Gateway(e));
            }
        };
        *self.last_check.lock() = Some(Instant::now());

        let summary = self.ingest(events).await;
        Ok(LiquidationCheck::Completed(summary))
    }

    fn rate_limited(&self) -> Option<Duration> {
        let last = (*self.last_check.lock())?;
        let since = last.elapsed();
        (since < self.config.min_interval).then(|| self.config.min_interval - since)
    }

    /// Apply a batch of liquidation events.
    ///
    /// Each event is handled on its own: a malformed or failing event is
    /// counted and never aborts the batch.
    pub async fn ingest(&self, events: Vec<LiquidationEvent>) -> LiquidationSummary {
        let mut summary = LiquidationSummary {
            fetched: events.len(),
            ..LiquidationSummary::default()
        };

        for event in events {
            let symbol = match event.validated_symbol() {
                Ok(symbol) => symbol,
                Err(reason) => {
                    summary.malformed += 1;
                    Metrics::liquidation("malformed");
                    warn!(instrument = %event.instrument, reason = %reason, "Malformed liquidation event");
                    continue;
                }
            };

            let key = event.dedup_key();
            if !self.seen.lock().insert(key.clone()) {
                summary.duplicates += 1;
                continue;
            }
            summary.new += 1;

            match self.apply(&event, &symbol).await {
                Ok(true) => {
                    summary.applied += 1;
                    Metrics::liquidation("applied");
                }
                Ok(false) => {
                    summary.unmatched += 1;
                    Metrics::liquidation("unmatched");
                }
                Err(e) => {
                    summary.failed += 1;
                    Metrics::liquidation("failed");
                    self.seen.lock().remove(&key);
                    error!(key = %key, error = %e, "Failed to apply liquidation");
                }
            }
        }

        if summary.new > 0 || summary.malformed > 0 {
            info!(
                fetched = summary.fetched,
                new = summary.new,
                applied = summary.applied,
                unmatched = summary.unmatched,
                failed = summary.failed,
                malformed = summary.malformed,
                "Liquidations reconciled"
            );
        }
        summary
    }

    /// Close the open leveraged position matching `event`.
    ///
    /// Returns `Ok(false)` if nothing was open.
    async fn apply(&self, event: &LiquidationEvent, symbol: &Symbol) -> MonitorResult<bool> {
        let open = self
            .positions
            .lookup_open_kind(symbol, PositionKind::LeveragedShort)
            .await?;
        if open.is_none() {
            info!(
                symbol = %symbol,
                timestamp_ms = event.timestamp_ms,
                "Liquidation without open position, skipping"
            );
            return Ok(false);
        }

        warn!(
            symbol = %symbol,
            exit_price = %event.exit_price,
            pnl_usd = %event.pnl_usd,
            pnl_percent = %event.pnl_percent(),
            "Position liquidated by exchange"
        );

        let known = KnownExit::settled(event.exit_price, event.pnl_usd, event.pnl_percent(), event.fee)
            .with_amount(event.size);
        let outcome = self
            .monitor
            .close(symbol, PositionKind::LeveragedShort, CloseReason::Liquidation, Some(known))
            .await?;
        Ok(matches!(outcome, CloseOutcome::Closed(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorConfig;
    use crate::paper::PaperExchange;
    use crate::sink::MemorySink;
    use autoclose_core::{OrderSide, Price, Size};
    use autoclose_persistence::{NewPosition, TimerStore};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    struct Harness {
        reconciler: LiquidationReconciler,
        paper: Arc<PaperExchange>,
        sink: Arc<MemorySink>,
        positions: PositionStore,
        timers: TimerStore,
    }

    fn harness() -> Harness {
        let paper = Arc::new(PaperExchange::new());
        let sink = Arc::new(MemorySink::new());
        let positions = PositionStore::open_in_memory().unwrap();
        let timers = TimerStore::open_in_memory().unwrap();
        let monitor = PositionMonitor::new(
            MonitorConfig::default(),
            paper.clone(),
            positions.clone(),
            timers.clone(),
            sink.clone(),
            sink.clone(),
        );
        let reconciler = LiquidationReconciler::new(
            LiquidationConfig {
                min_interval: Duration::from_secs(60),
                lookback: Duration::from_secs(300),
            },
            paper.clone(),
            monitor,
        );
        Harness {
            reconciler,
            paper,
            sink,
            positions,
            timers,
        }
    }

    fn event(instrument: &str, ts: i64) -> LiquidationEvent {
        LiquidationEvent {
            instrument: instrument.to_string(),
            timestamp_ms: ts,
            exit_price: Price::new(dec!(110)),
            pnl_usd: dec!(-85),
            pnl_ratio: dec!(-0.85),
            fee: Some(dec!(0.3)),
            size: Some(Size::new(dec!(1))),
        }
    }

    async fn open_short(h: &Harness, symbol: &Symbol) {
        h.positions
            .open_position(
                symbol,
                PositionKind::LeveragedShort,
                NewPosition::new(Price::new(dec!(100)), Size::new(dec!(1))).with_leverage(dec!(10)),
            )
            .await
            .unwrap();
        h.paper.set_contract(symbol, Size::new(dec!(1)), OrderSide::Sell);
        h.timers.add(symbol, Utc::now(), Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_liquidation_closes_position_once() {
        let h = harness();
        let swap = Symbol::new("BTC-USDT-SWAP").unwrap();
        open_short(&h, &swap).await;
        let mut liquidated = event("BTC-USDT-SWAP", 171234);
        liquidated.size = Some(Size::new(dec!(0.8)));
        h.paper.push_liquidation(liquidated);

        let first = assert_ok!(h.reconciler.check(true).await);
        let LiquidationCheck::Completed(summary) = first else {
            panic!("expected completed check");
        };
        assert_eq!(summary.new, 1);
        assert_eq!(summary.applied, 1);

        let second = assert_ok!(h.reconciler.check(true).await);
        let LiquidationCheck::Completed(summary) = second else {
            panic!("expected completed check");
        };
        assert_eq!(summary.new, 0);
        assert_eq!(summary.duplicates, 1);

        let closed = h.positions.list_closed(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, Some(CloseReason::Liquidation));
        assert_eq!(closed[0].exit_price, Some(Price::new(dec!(110))));
        assert_eq!(closed[0].pnl_percent, Some(dec!(-85)));
        assert_eq!(closed[0].fee, Some(dec!(0.3)));
        assert_eq!(closed[0].amount, Size::new(dec!(0.8)));

        assert!(h.paper.orders().is_empty());
        assert!(!h.timers.has(&swap).await.unwrap());
        assert_eq!(h.sink.records().len(), 1);
        assert!(h.sink.records()[0].flatten_skipped);
        assert_eq!(h.sink.records()[0].amount, Size::new(dec!(0.8)));
    }

    #[tokio::test]
    async fn test_check_is_rate_limited() {
        let h = harness();
        assert!(matches!(
            h.reconciler.check(false).await.unwrap(),
            LiquidationCheck::Completed(_)
        ));
        assert!(matches!(
            h.reconciler.check(false).await.unwrap(),
            LiquidationCheck::Skipped { .. }
        ));
        assert!(matches!(
            h.reconciler.check(true).await.unwrap(),
            LiquidationCheck::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_unmatched_and_malformed_do_not_abort_batch() {
        let h = harness();
        let swap = Symbol::new("ETH-USDT-SWAP").unwrap();
        open_short(&h, &swap).await;

        let summary = h
            .reconciler
            .ingest(vec![
                event("", 1),
                event("SOL-USDT-SWAP", 0),
                event("DOGE-USDT-SWAP", 5),
                event("ETH-USDT-SWAP", 7),
            ])
            .await;

        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(h.reconciler.seen_count(), 2);
        assert!(h.positions.lookup_open(&swap).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directional_position_is_not_liquidated() {
        let h = harness();
        let spot = Symbol::new("BTC-USDT").unwrap();
        h.positions
            .open_position(
                &spot,
                PositionKind::Directional,
                NewPosition::new(Price::new(dec!(100)), Size::new(dec!(1))),
            )
            .await
            .unwrap();

        let summary = h.reconciler.ingest(vec![event("BTC-USDT", 9)]).await;
        assert_eq!(summary.unmatched, 1);
        assert!(h.positions.lookup_open(&spot).await.unwrap().is_some());
    }
}
