#![warn(missing_docs)]

//! # Archflow Metrics
//!
//! In-memory metrics for the engine and its collaborators:
//!
//! - [`MetricsRegistry`] — lock-free counters, additive gauges and per-key
//!   value series with snapshot generation
//! - [`FlowMetricsCollector`] — flow/step aggregation plus a periodic export
//!   task that never blocks the execution path
//! - [`export`] — pluggable export backends (log, prometheus, influxdb, http)
//!
//! Failures anywhere in this crate are logged and never propagate into
//! execution outcomes.

pub mod collector;
pub mod export;
pub mod registry;

pub use collector::{FlowMetricsCollector, MetricsConfig};
pub use export::{ExportBackend, ExportError, MetricsExporter};
pub use registry::{Counter, Gauge, MetricsRegistry, MetricsSnapshot, ValueSeries, ValueStats};
