//! Flow/step metrics aggregation and periodic export.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use archflow_execution::{ExecutionMetrics, FlowStatus, StepMetrics};

use crate::export::{ExportBackend, MetricsExporter, build_exporter};
use crate::registry::{MetricsRegistry, MetricsSnapshot};

/// Collector configuration (`metrics.*` options).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Master switch; a disabled collector records but never exports.
    pub enabled: bool,
    /// Seconds between periodic exports.
    pub interval_secs: u64,
    /// Which export backend to use.
    pub backend: ExportBackend,
    /// Push URL for the prometheus/influxdb/http backends.
    pub url: Option<String>,
    /// Run each export on its own task instead of awaiting inline.
    pub export_async: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            backend: ExportBackend::Log,
            url: None,
            export_async: true,
        }
    }
}

/// Aggregates flow and step metrics and exports snapshots periodically.
///
/// Recording methods are cheap (atomics or a short per-key lock) and never
/// block on export; the periodic task owns its own schedule.
pub struct FlowMetricsCollector {
    registry: MetricsRegistry,
    exporter: Arc<dyn MetricsExporter>,
    config: MetricsConfig,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlowMetricsCollector {
    /// Create a collector with the backend selected by `config`.
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        let exporter: Arc<dyn MetricsExporter> =
            Arc::from(build_exporter(config.backend, config.url.clone()));
        Self::with_exporter(config, exporter)
    }

    /// Create a collector with an explicit exporter (used by tests).
    #[must_use]
    pub fn with_exporter(config: MetricsConfig, exporter: Arc<dyn MetricsExporter>) -> Self {
        Self {
            registry: MetricsRegistry::new(),
            exporter,
            config,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// The underlying registry (shared with interceptors and the engine).
    #[must_use]
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Start the periodic export task. No-op when disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        let collector = Arc::clone(self);
        let cancel = self.shutdown.clone();
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the first export
            // happens one full interval after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => collector.export_once().await,
                }
            }
        }));
    }

    async fn export_once(&self) {
        let snapshot = self.registry.snapshot();
        if self.config.export_async {
            let exporter = Arc::clone(&self.exporter);
            tokio::spawn(async move {
                if let Err(error) = exporter.export(&snapshot).await {
                    tracing::warn!(backend = exporter.name(), %error, "metrics export failed");
                }
            });
        } else if let Err(error) = self.exporter.export(&snapshot).await {
            tracing::warn!(backend = self.exporter.name(), %error, "metrics export failed");
        }
    }

    /// Record that a flow run started.
    pub fn record_flow_start(&self, flow_id: &str) {
        self.registry.counter("archflow_flows_started_total").inc();
        self.registry.gauge("archflow_flows_active").add(1.0);
        tracing::debug!(flow_id, "flow start recorded");
    }

    /// Record a finished run with its aggregated metrics.
    pub fn record_flow_completion(&self, flow_id: &str, metrics: &ExecutionMetrics, success: bool) {
        self.registry.gauge("archflow_flows_active").add(-1.0);
        if success {
            self.registry.counter("archflow_flows_completed_total").inc();
        } else {
            self.registry.counter("archflow_flows_failed_total").inc();
        }
        self.registry
            .counter("archflow_tokens_total")
            .add(metrics.tokens as i64);
        self.registry
            .series("archflow_flow_duration_ms")
            .record(metrics.duration_ms as f64);
        self.registry
            .series("archflow_flow_tokens")
            .record(metrics.tokens as f64);
        tracing::debug!(flow_id, success, "flow completion recorded");
    }

    /// Record a run-level error.
    pub fn record_flow_error(&self, flow_id: &str, error: &str) {
        self.registry.counter("archflow_flow_errors_total").inc();
        tracing::debug!(flow_id, error, "flow error recorded");
    }

    /// Record one step's measurements.
    pub fn record_step_metrics(&self, flow_id: &str, step_id: &str, metrics: &StepMetrics) {
        self.registry.counter("archflow_steps_total").inc();
        self.registry
            .counter("archflow_step_retries_total")
            .add(i64::from(metrics.retry_count));
        self.registry
            .series("archflow_step_duration_ms")
            .record(metrics.duration_ms as f64);
        for (name, value) in &metrics.extra {
            self.registry
                .series(&format!("archflow_step_{name}"))
                .record(*value);
        }
        tracing::trace!(flow_id, step_id, "step metrics recorded");
    }

    /// Record a run status transition.
    pub fn record_flow_status(&self, flow_id: &str, status: FlowStatus) {
        self.registry
            .counter(&format!("archflow_flow_status_{status}_total"))
            .inc();
        tracing::trace!(flow_id, %status, "flow status recorded");
    }

    /// Aggregate everything recorded so far.
    #[must_use]
    pub fn aggregate(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    /// Stop the periodic task and flush one final snapshot.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let snapshot = self.registry.snapshot();
        if let Err(error) = self.exporter.export(&snapshot).await {
            tracing::warn!(backend = self.exporter.name(), %error, "final metrics export failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExporter {
        exports: AtomicUsize,
    }

    #[async_trait]
    impl MetricsExporter for CountingExporter {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn export(&self, _snapshot: &MetricsSnapshot) -> Result<(), crate::ExportError> {
            self.exports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn collector_with_counter(interval_secs: u64) -> (Arc<FlowMetricsCollector>, Arc<CountingExporter>) {
        let exporter = Arc::new(CountingExporter {
            exports: AtomicUsize::new(0),
        });
        let config = MetricsConfig {
            interval_secs,
            export_async: false,
            ..MetricsConfig::default()
        };
        (
            Arc::new(FlowMetricsCollector::with_exporter(config, exporter.clone())),
            exporter,
        )
    }

    #[test]
    fn flow_lifecycle_updates_registry() {
        let (collector, _) = collector_with_counter(300);
        collector.record_flow_start("wf");
        collector.record_flow_completion(
            "wf",
            &ExecutionMetrics {
                duration_ms: 120,
                tokens: 30,
                ..ExecutionMetrics::default()
            },
            true,
        );

        let snapshot = collector.aggregate();
        assert_eq!(snapshot.counters["archflow_flows_started_total"], 1);
        assert_eq!(snapshot.counters["archflow_flows_completed_total"], 1);
        assert_eq!(snapshot.counters["archflow_tokens_total"], 30);
        assert_eq!(snapshot.values["archflow_flows_active"], 0.0);
        assert_eq!(snapshot.stats["archflow_flow_duration_ms"].count, 1);
    }

    #[test]
    fn step_metrics_feed_series_and_retries() {
        let (collector, _) = collector_with_counter(300);
        let mut metrics = StepMetrics {
            duration_ms: 50,
            tokens: 10,
            retry_count: 2,
            ..StepMetrics::default()
        };
        metrics.extra.insert("cache_hits".into(), 1.0);
        collector.record_step_metrics("wf", "A", &metrics);

        let snapshot = collector.aggregate();
        assert_eq!(snapshot.counters["archflow_steps_total"], 1);
        assert_eq!(snapshot.counters["archflow_step_retries_total"], 2);
        assert_eq!(snapshot.stats["archflow_step_cache_hits"].count, 1);
    }

    #[test]
    fn status_transitions_are_counted() {
        let (collector, _) = collector_with_counter(300);
        collector.record_flow_status("wf", FlowStatus::Suspended);
        collector.record_flow_status("wf", FlowStatus::Completed);

        let snapshot = collector.aggregate();
        assert_eq!(snapshot.counters["archflow_flow_status_suspended_total"], 1);
        assert_eq!(snapshot.counters["archflow_flow_status_completed_total"], 1);
    }

    #[tokio::test]
    async fn close_flushes_a_final_snapshot() {
        let (collector, exporter) = collector_with_counter(3600);
        collector.start();
        collector.record_flow_start("wf");
        collector.close().await;
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_export_fires_on_interval() {
        let (collector, exporter) = collector_with_counter(5);
        collector.start();

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert!(exporter.exports.load(Ordering::SeqCst) >= 2);
        collector.close().await;
    }
}
