//! Main application orchestration.
//!
//! Coordinates all components:
//! - Startup recovery (must finish before any trigger is accepted)
//! - Sweep loop: periodic full reconciliation of open positions
//! - Liquidation loop: forced-liquidation polling
//! - Stats loop: periodic metrics summary in the log
//! - Shutdown: loops observe the cancellation token, timers are stopped
//!   without closing anything, store workers are drained

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autoclose_core::{PositionKind, Price, Size, Symbol};
use autoclose_persistence::{NewPosition, PositionRecord, PositionStore, TimerEntry, TimerStore};
use autoclose_position::{
    DynGateway, LedgerSink, LiquidationCheck, LiquidationReconciler, NotificationSink,
    PositionMonitor, RestoreReport,
};
use autoclose_telemetry::StatsReporter;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::sinks::{JsonLinesSink, LogNotifier};

/// Snapshot of the persisted state, for the `status` command.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub open: Vec<PositionRecord>,
    pub timers: Vec<TimerEntry>,
    /// Most recent closes, newest first.
    pub closed: Vec<PositionRecord>,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    monitor: Arc<PositionMonitor>,
    liquidations: Option<Arc<LiquidationReconciler>>,
    positions: PositionStore,
    timers: TimerStore,
    shutdown: CancellationToken,
}

impl Application {
    /// Create the application with on-disk stores and the default sinks.
    pub fn new(config: AppConfig, gateway: DynGateway) -> AppResult<Self> {
        let positions = PositionStore::open(&config.persistence.positions_db)?;
        let timers = TimerStore::open(&config.persistence.timers_db)?;
        let ledger = Arc::new(JsonLinesSink::new(&config.persistence.ledger_dir)?);

        info!(
            positions_db = %config.persistence.positions_db,
            timers_db = %config.persistence.timers_db,
            ledger_dir = %config.persistence.ledger_dir,
            "Stores opened"
        );

        Ok(Self::with_components(
            config,
            gateway,
            positions,
            timers,
            Arc::new(LogNotifier::new()),
            ledger,
        ))
    }

    /// Create the application from already opened stores and sinks.
    pub fn with_components(
        config: AppConfig,
        gateway: DynGateway,
        positions: PositionStore,
        timers: TimerStore,
        notifier: Arc<dyn NotificationSink>,
        ledger: Arc<dyn LedgerSink>,
    ) -> Self {
        let monitor = PositionMonitor::new(
            config.monitor_config(),
            gateway.clone(),
            positions.clone(),
            timers.clone(),
            notifier,
            ledger,
        );
        let liquidations = config.liquidation.enabled.then(|| {
            Arc::new(LiquidationReconciler::new(
                config.liquidation_config(),
                gateway,
                monitor.clone(),
            ))
        });

        Self {
            config,
            monitor,
            liquidations,
            positions,
            timers,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn liquidations(&self) -> Option<&Arc<LiquidationReconciler>> {
        self.liquidations.as_ref()
    }

    #[must_use]
    pub fn positions(&self) -> &PositionStore {
        &self.positions
    }

    /// Token that stops `run` when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Record an opened position and arm its hold timer.
    ///
    /// `leverage` falls back to `monitor.default_leverage`.
    pub async fn open_position(
        &self,
        symbol: &Symbol,
        kind: PositionKind,
        entry_price: Price,
        amount: Size,
        leverage: Option<Decimal>,
    ) -> AppResult<i64> {
        let leverage = leverage.unwrap_or(self.config.monitor.default_leverage);
        let id = self
            .positions
            .open_position(
                symbol,
                kind,
                NewPosition::new(entry_price, amount).with_leverage(leverage),
            )
            .await?;
        self.monitor.on_position_opened(symbol).await?;

        info!(
            id,
            symbol = %symbol,
            kind = %kind,
            entry_price = %entry_price,
            amount = %amount,
            leverage = %leverage,
            "Position opened"
        );
        Ok(id)
    }

    /// Open positions, persisted timers and the last `closed_limit` closes.
    pub async fn status(&self, closed_limit: usize) -> AppResult<StatusReport> {
        let closed = if closed_limit == 0 {
            Vec::new()
        } else {
            self.positions.list_closed(closed_limit).await?
        };
        Ok(StatusReport {
            open: self.positions.list_open().await?,
            timers: self.timers.list_all().await?,
            closed,
        })
    }

    /// Startup recovery.
    pub async fn restore(&self) -> AppResult<RestoreReport> {
        Ok(self.monitor.restore().await?)
    }

    /// Run until Ctrl-C or until the shutdown token is cancelled.
    pub async fn run(self) -> AppResult<()> {
        info!(
            target_profit_pct = %self.config.monitor.target_profit_pct,
            hold_secs = self.config.monitor.hold_secs,
            liquidation_enabled = self.config.liquidation.enabled,
            "Starting application"
        );

        // Recovery completes before any loop starts.
        self.restore().await?;

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                "sweep",
                tokio::spawn(run_sweep_loop(
                    self.monitor.clone(),
                    self.config.monitor.sweep_interval(),
                    self.shutdown.clone(),
                )),
            ),
            (
                "stats",
                tokio::spawn(run_stats_loop(
                    StatsReporter::new(),
                    self.config.telemetry.stats_interval(),
                    self.shutdown.clone(),
                )),
            ),
        ];
        if let Some(reconciler) = &self.liquidations {
            tasks.push((
                "liquidation",
                tokio::spawn(run_liquidation_loop(
                    reconciler.clone(),
                    self.config.liquidation.poll_interval(),
                    self.shutdown.clone(),
                )),
            ));
        }

        info!("Entering main loop");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.shutdown.cancel();
        let mut failure = None;
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Background task failed");
                failure = Some(AppError::Task(format!("{name}: {e}")));
            }
        }

        self.shutdown().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every timer (rows are kept) and drain the store workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let stopped = self.monitor.stop_all().await;
        self.positions.shutdown().await;
        self.timers.shutdown().await;
        info!(stopped_timers = stopped, "Shutdown complete");
    }
}

async fn run_sweep_loop(monitor: Arc<PositionMonitor>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; restore has just checked everything.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match monitor.sweep().await {
                    Ok(report) => debug!(
                        checked = report.checked,
                        closed = report.closed,
                        errors = report.errors,
                        "Sweep tick"
                    ),
                    Err(e) => error!(error = %e, "Sweep failed"),
                }
            }
        }
    }
    debug!("Sweep loop stopped");
}

async fn run_stats_loop(reporter: StatsReporter, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => reporter.log_summary(),
        }
    }
    // Final summary covers the whole run.
    reporter.log_summary();
    debug!("Stats loop stopped");
}

async fn run_liquidation_loop(
    reconciler: Arc<LiquidationReconciler>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match reconciler.check(false).await {
                    Ok(LiquidationCheck::Completed(summary)) if summary.failed > 0 => {
                        warn!(failed = summary.failed, "Some liquidations will be retried");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Liquidation check failed"),
                }
            }
        }
    }
    debug!("Liquidation loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoclose_core::CloseReason;
    use autoclose_position::{MemorySink, PaperExchange};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn app(config: AppConfig) -> (Application, Arc<PaperExchange>) {
        let paper = Arc::new(PaperExchange::new());
        let sink = Arc::new(MemorySink::new());
        let app = Application::with_components(
            config,
            paper.clone(),
            PositionStore::open_in_memory().unwrap(),
            TimerStore::open_in_memory().unwrap(),
            sink.clone(),
            sink,
        );
        (app, paper)
    }

    #[tokio::test]
    async fn test_open_uses_default_leverage() {
        let mut config = AppConfig::default();
        config.monitor.default_leverage = dec!(3);
        let (app, _) = app(config);
        let swap = Symbol::new("BTC-USDT-SWAP").unwrap();

        app.open_position(
            &swap,
            PositionKind::LeveragedShort,
            Price::new(dec!(100)),
            Size::new(dec!(1)),
            None,
        )
        .await
        .unwrap();

        let status = assert_ok!(app.status(5).await);
        assert_eq!(status.open.len(), 1);
        assert_eq!(status.open[0].leverage, dec!(3));
        assert_eq!(status.timers.len(), 1);
        assert!(status.closed.is_empty());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_lists_recent_closes() {
        let (app, paper) = app(AppConfig::default());
        let btc = Symbol::new("BTC-USDT").unwrap();
        let eth = Symbol::new("ETH-USDT").unwrap();
        for symbol in [&btc, &eth] {
            paper.set_price(symbol, Price::new(dec!(100)));
            app.open_position(
                symbol,
                PositionKind::Directional,
                Price::new(dec!(100)),
                Size::new(dec!(1)),
                None,
            )
            .await
            .unwrap();
        }
        app.monitor()
            .close(&btc, PositionKind::Directional, CloseReason::Timeout, None)
            .await
            .unwrap();

        let status = assert_ok!(app.status(10).await);
        assert_eq!(status.open.len(), 1);
        assert_eq!(status.closed.len(), 1);
        assert_eq!(status.closed[0].symbol, btc);
        assert_eq!(status.closed[0].reason, Some(CloseReason::Timeout));

        let without = assert_ok!(app.status(0).await);
        assert!(without.closed.is_empty());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_loop_stops_on_cancel() {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_stats_loop(
            StatsReporter::new(),
            Duration::from_millis(10),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(35)).await;
        token.cancel();

        let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_duplicate_open_is_rejected() {
        let (app, _) = app(AppConfig::default());
        let btc = Symbol::new("BTC-USDT").unwrap();

        app.open_position(
            &btc,
            PositionKind::Directional,
            Price::new(dec!(100)),
            Size::new(dec!(1)),
            Some(dec!(1)),
        )
        .await
        .unwrap();

        let second = app
            .open_position(
                &btc,
                PositionKind::Directional,
                Price::new(dec!(101)),
                Size::new(dec!(1)),
                None,
            )
            .await;
        let err = assert_err!(second);
        assert!(matches!(
            err,
            AppError::Persistence(autoclose_persistence::PersistenceError::AlreadyOpen { .. })
        ));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_liquidation_disabled_has_no_reconciler() {
        let mut config = AppConfig::default();
        config.liquidation.enabled = false;
        let (app, _) = app(config);
        assert!(app.liquidations().is_none());
    }
}
