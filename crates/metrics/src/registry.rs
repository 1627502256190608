//! Metric primitives and registry.
//!
//! Counters are atomic `i64`s, gauges are lock-free additive `f64`
//! accumulators (bit-cast CAS), and value series are append-only `f64`
//! histories under a per-key lock. A [`MetricsRegistry::snapshot`] produces
//! an immutable view for export.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by a given amount.
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A lock-free additive `f64` accumulator.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    bits: Arc<AtomicU64>,
}

impl Gauge {
    /// Add a delta (may be negative).
    pub fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) + delta;
            match self.bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Overwrite the value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// An append-only history of `f64` observations.
#[derive(Debug, Clone, Default)]
pub struct ValueSeries {
    values: Arc<Mutex<Vec<f64>>>,
}

impl ValueSeries {
    /// Record one observation.
    pub fn record(&self, value: f64) {
        self.values.lock().push(value);
    }

    /// Snapshot of all observations.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.values.lock().clone()
    }

    /// Summary statistics, `None` when empty.
    #[must_use]
    pub fn stats(&self) -> Option<ValueStats> {
        let values = self.values.lock();
        ValueStats::over(&values)
    }
}

/// Summary statistics over one value series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueStats {
    /// Number of observations.
    pub count: u64,
    /// Smallest observation.
    pub min: f64,
    /// Largest observation.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Sum of all observations.
    pub sum: f64,
}

impl ValueStats {
    fn over(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count: values.len() as u64,
            min,
            max,
            mean: sum / values.len() as f64,
            sum,
        })
    }
}

/// Immutable view of the registry at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Counter values by name.
    pub counters: BTreeMap<String, i64>,
    /// Gauge values by name.
    pub values: BTreeMap<String, f64>,
    /// Series statistics by name.
    pub stats: BTreeMap<String, ValueStats>,
}

/// Registry for creating and retrieving named metrics.
///
/// Retrieving the same name always returns a handle onto the same metric.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<DashMap<String, Counter>>,
    gauges: Arc<DashMap<String, Gauge>>,
    series: Arc<DashMap<String, ValueSeries>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter.
    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_owned()).or_default().clone()
    }

    /// Get or create a gauge.
    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_owned()).or_default().clone()
    }

    /// Get or create a value series.
    pub fn series(&self, name: &str) -> ValueSeries {
        self.series.entry(name.to_owned()).or_default().clone()
    }

    /// Take an immutable snapshot of every metric.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().get()))
                .collect(),
            values: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().get()))
                .collect(),
            stats: self
                .series
                .iter()
                .filter_map(|e| e.value().stats().map(|s| (e.key().clone(), s)))
                .collect(),
        }
    }

    /// Drop every metric. Used only by tests.
    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.series.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counter_accumulates() {
        let registry = MetricsRegistry::new();
        let counter = registry.counter("archflow_runs_total");
        counter.inc();
        counter.add(5);
        assert_eq!(registry.counter("archflow_runs_total").get(), 6);
    }

    #[test]
    fn gauge_adds_and_sets() {
        let registry = MetricsRegistry::new();
        let gauge = registry.gauge("archflow_flows_active");
        gauge.add(2.0);
        gauge.add(-0.5);
        assert!((gauge.get() - 1.5).abs() < f64::EPSILON);
        gauge.set(42.0);
        assert!((gauge.get() - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn series_stats() {
        let registry = MetricsRegistry::new();
        let series = registry.series("archflow_step_duration_ms");
        for v in [10.0, 20.0, 30.0] {
            series.record(v);
        }
        let stats = series.stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.mean, 20.0);
        assert_eq!(stats.sum, 60.0);
    }

    #[test]
    fn empty_series_has_no_stats() {
        let series = ValueSeries::default();
        assert!(series.stats().is_none());
    }

    #[test]
    fn same_name_returns_same_metric() {
        let registry = MetricsRegistry::new();
        registry.counter("a").inc();
        registry.counter("a").inc();
        assert_eq!(registry.counter("a").get(), 2);
    }

    #[test]
    fn snapshot_captures_everything() {
        let registry = MetricsRegistry::new();
        registry.counter("archflow_flows_completed_total").add(3);
        registry.gauge("archflow_flows_active").add(1.0);
        registry.series("archflow_flow_duration_ms").record(12.5);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters["archflow_flows_completed_total"], 3);
        assert_eq!(snapshot.values["archflow_flows_active"], 1.0);
        assert_eq!(snapshot.stats["archflow_flow_duration_ms"].count, 1);
    }

    #[test]
    fn concurrent_gauge_adds_do_not_lose_updates() {
        let gauge = Gauge::default();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gauge = gauge.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        gauge.add(1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gauge.get(), 8000.0);
    }

    #[test]
    fn reset_clears_all_metrics() {
        let registry = MetricsRegistry::new();
        registry.counter("x").inc();
        registry.reset();
        assert_eq!(registry.counter("x").get(), 0);
    }
}
