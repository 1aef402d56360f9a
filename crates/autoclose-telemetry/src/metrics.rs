//! Prometheus metrics for the auto-close engine.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a startup-time programming error. These
//! panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

/// Close attempts by trigger and result.
/// Labels: reason (timeout/target/liquidation), outcome (closed/already_closed/failed)
pub static CLOSES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "autoclose_closes_total",
        "Total close attempts by reason and outcome",
        &["reason", "outcome"]
    )
    .unwrap()
});

/// Close failures by the step that failed.
/// Labels: stage (size_query/order/commit/notify/ledger/timer_remove)
pub static CLOSE_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "autoclose_close_failures_total",
        "Total close path failures by stage",
        &["stage"]
    )
    .unwrap()
});

/// In-memory timers currently armed.
pub static ARMED_TIMERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("autoclose_armed_timers", "Hold timers currently armed").unwrap()
});

/// Liquidation events by processing result.
/// Labels: result (applied/unmatched/duplicate/malformed/failed)
pub static LIQUIDATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "autoclose_liquidations_total",
        "Total forced-liquidation events by processing result",
        &["result"]
    )
    .unwrap()
});

/// Price checks by result.
/// Labels: result (holding/not_confirmed/closed/skipped/no_position)
pub static PRICE_CHECKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "autoclose_price_checks_total",
        "Total price checks by result",
        &["result"]
    )
    .unwrap()
});

/// Exchange call latency in milliseconds.
pub static EXCHANGE_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "autoclose_exchange_latency_ms",
        "Exchange gateway call latency in milliseconds",
        &["call"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record a close attempt.
    pub fn close_attempt(reason: &str, outcome: &str) {
        CLOSES_TOTAL.with_label_values(&[reason, outcome]).inc();
    }

    /// Record a failed step of the close path.
    pub fn close_failure(stage: &str) {
        CLOSE_FAILURES_TOTAL.with_label_values(&[stage]).inc();
    }

    pub fn timer_armed() {
        ARMED_TIMERS.inc();
    }

    pub fn timer_disarmed() {
        ARMED_TIMERS.dec();
    }

    /// Record a liquidation event result.
    pub fn liquidation(result: &str) {
        LIQUIDATIONS_TOTAL.with_label_values(&[result]).inc();
    }

    /// Record a price check result.
    pub fn price_check(result: &str) {
        PRICE_CHECKS_TOTAL.with_label_values(&[result]).inc();
    }

    /// Record an exchange call latency.
    pub fn exchange_latency(call: &str, latency_ms: f64) {
        EXCHANGE_LATENCY_MS
            .with_label_values(&[call])
            .observe(latency_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_updates_series() {
        let before = CLOSE_FAILURES_TOTAL.with_label_values(&["order"]).get();
        Metrics::close_failure("order");
        assert!(CLOSE_FAILURES_TOTAL.with_label_values(&["order"]).get() >= before + 1.0);

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "autoclose_close_failures_total"));
    }
}
