//! Periodic statistics summary.
//!
//! Reads the registered Prometheus series back and writes them to the log,
//! so a running service reports its close activity without a scrape
//! endpoint:
//! - close attempts by reason and outcome
//! - close path failures by stage
//! - liquidation and price check results
//! - armed timers and exchange latency (P50/P95)

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use prometheus::core::Collector;
use prometheus::proto::{Bucket, MetricFamily};
use tracing::info;

use crate::metrics::{
    ARMED_TIMERS, CLOSES_TOTAL, CLOSE_FAILURES_TOTAL, EXCHANGE_LATENCY_MS, LIQUIDATIONS_TOTAL,
    PRICE_CHECKS_TOTAL,
};

/// Latency distribution of one exchange call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// Point-in-time view of every engine metric.
///
/// Counter maps are keyed by label values joined with `/`
/// (e.g. `timeout/closed`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub closes: BTreeMap<String, u64>,
    pub close_failures: BTreeMap<String, u64>,
    pub liquidations: BTreeMap<String, u64>,
    pub price_checks: BTreeMap<String, u64>,
    pub armed_timers: i64,
    pub exchange_latency: BTreeMap<String, LatencyStats>,
}

impl StatsSnapshot {
    /// Committed closes across every reason.
    #[must_use]
    pub fn closed_total(&self) -> u64 {
        self.closes
            .iter()
            .filter(|(key, _)| key.ends_with("/closed"))
            .map(|(_, count)| count)
            .sum()
    }
}

/// Statistics reporter.
pub struct StatsReporter {
    start_time: Instant,
}

impl StatsReporter {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Read the current value of every series.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.start_time.elapsed(),
            closes: counter_values(&CLOSES_TOTAL.collect()),
            close_failures: counter_values(&CLOSE_FAILURES_TOTAL.collect()),
            liquidations: counter_values(&LIQUIDATIONS_TOTAL.collect()),
            price_checks: counter_values(&PRICE_CHECKS_TOTAL.collect()),
            armed_timers: ARMED_TIMERS.get(),
            exchange_latency: latency_values(&EXCHANGE_LATENCY_MS.collect()),
        }
    }

    /// Write the current snapshot to the log.
    pub fn log_summary(&self) {
        let stats = self.snapshot();
        let minutes = stats.uptime.as_secs() / 60;

        info!("========== Statistics Summary ==========");
        info!(
            uptime = format!("{}h {}m", minutes / 60, minutes % 60),
            closed = stats.closed_total(),
            armed_timers = stats.armed_timers,
            "Engine"
        );
        for (key, count) in &stats.closes {
            info!(series = %key, count, "Close attempts");
        }
        for (stage, count) in &stats.close_failures {
            info!(stage = %stage, count, "Close failures");
        }
        for (result, count) in &stats.liquidations {
            info!(result = %result, count, "Liquidations");
        }
        for (result, count) in &stats.price_checks {
            info!(result = %result, count, "Price checks");
        }
        for (call, latency) in &stats.exchange_latency {
            info!(
                call = %call,
                count = latency.count,
                p50_ms = format!("{:.1}", latency.p50_ms),
                p95_ms = format!("{:.1}", latency.p95_ms),
                "Exchange latency"
            );
        }
        info!("=========================================");
    }
}

impl Default for StatsReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn label_key(metric: &prometheus::proto::Metric) -> String {
    metric
        .get_label()
        .iter()
        .map(|pair| pair.get_value())
        .collect::<Vec<_>>()
        .join("/")
}

fn counter_values(families: &[MetricFamily]) -> BTreeMap<String, u64> {
    families
        .iter()
        .flat_map(|mf| mf.get_metric())
        .map(|m| (label_key(m), m.get_counter().get_value() as u64))
        .collect()
}

fn latency_values(families: &[MetricFamily]) -> BTreeMap<String, LatencyStats> {
    families
        .iter()
        .flat_map(|mf| mf.get_metric())
        .filter_map(|m| {
            let h = m.get_histogram();
            let count = h.get_sample_count();
            if count == 0 {
                return None;
            }
            let buckets = h.get_bucket();
            Some((
                label_key(m),
                LatencyStats {
                    count,
                    p50_ms: percentile_from_buckets(buckets, count, 0.50),
                    p95_ms: percentile_from_buckets(buckets, count, 0.95),
                },
            ))
        })
        .collect()
}

/// Percentile from cumulative histogram buckets, interpolated linearly
/// within the bucket that crosses the target rank.
fn percentile_from_buckets(buckets: &[Bucket], total_count: u64, percentile: f64) -> f64 {
    let target = (total_count as f64 * percentile).ceil() as u64;
    let mut prev_bound = 0.0;
    let mut prev_count = 0u64;

    for bucket in buckets {
        let upper_bound = bucket.get_upper_bound();
        let cumulative = bucket.get_cumulative_count();
        if cumulative >= target {
            let in_bucket = cumulative - prev_count;
            if in_bucket == 0 {
                return upper_bound;
            }
            let position = (target - prev_count) as f64 / in_bucket as f64;
            return prev_bound + position * (upper_bound - prev_bound);
        }
        prev_bound = upper_bound;
        prev_count = cumulative;
    }

    buckets.last().map(|b| b.get_upper_bound()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn test_snapshot_reads_recorded_series() {
        let reporter = StatsReporter::new();
        let before = reporter.snapshot();

        Metrics::close_attempt("timeout", "closed");
        Metrics::close_attempt("timeout", "closed");
        Metrics::liquidation("applied");
        Metrics::exchange_latency("stats_test_call", 12.0);

        let after = reporter.snapshot();
        let count = |s: &StatsSnapshot| s.closes.get("timeout/closed").copied().unwrap_or(0);
        assert!(count(&after) >= count(&before) + 2);
        assert!(after.closed_total() >= 2);
        assert!(after.liquidations.get("applied").copied().unwrap_or(0) >= 1);

        let latency = after.exchange_latency.get("stats_test_call").unwrap();
        assert_eq!(latency.count, 1);
        assert!(latency.p50_ms > 10.0 && latency.p50_ms <= 25.0);

        reporter.log_summary();
    }

    #[test]
    fn test_percentile_interpolates_within_bucket() {
        let bucket = |upper: f64, cumulative: u64| {
            let mut b = Bucket::default();
            b.set_upper_bound(upper);
            b.set_cumulative_count(cumulative);
            b
        };
        let buckets = vec![bucket(10.0, 50), bucket(20.0, 100)];

        assert_eq!(percentile_from_buckets(&buckets, 100, 0.50), 10.0);
        assert_eq!(percentile_from_buckets(&buckets, 100, 0.75), 15.0);
        assert_eq!(percentile_from_buckets(&[], 0, 0.5), 0.0);
    }
}
