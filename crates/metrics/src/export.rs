//! Pluggable metrics export backends.
//!
//! Encoding functions are separated from transport so the Prometheus text
//! form can also back a scrape endpoint. Export failures are surfaced as
//! [`ExportError`] to the caller (the collector), which logs them — they
//! never reach the engine.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::registry::MetricsSnapshot;

/// Error raised by an export attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The HTTP push failed.
    #[error("metrics push failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The snapshot could not be encoded.
    #[error("metrics encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Which export backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportBackend {
    /// Emit snapshots through `tracing`.
    #[default]
    Log,
    /// Prometheus text exposition, pushed or logged.
    Prometheus,
    /// InfluxDB line protocol, pushed or logged.
    Influxdb,
    /// JSON snapshot POSTed to a collector URL.
    Http,
}

impl FromStr for ExportBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "prometheus" => Ok(Self::Prometheus),
            "influxdb" => Ok(Self::Influxdb),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown metrics backend: {other}")),
        }
    }
}

impl fmt::Display for ExportBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Prometheus => write!(f, "prometheus"),
            Self::Influxdb => write!(f, "influxdb"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// A metrics export sink.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Export one snapshot.
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError>;
}

/// Construct the exporter selected by `backend`.
#[must_use]
pub fn build_exporter(backend: ExportBackend, url: Option<String>) -> Box<dyn MetricsExporter> {
    match backend {
        ExportBackend::Log => Box::new(LogExporter),
        ExportBackend::Prometheus => Box::new(PrometheusExporter::new(url)),
        ExportBackend::Influxdb => Box::new(InfluxExporter::new(url)),
        ExportBackend::Http => Box::new(HttpExporter::new(url.unwrap_or_default())),
    }
}

/// Encode a snapshot in Prometheus text exposition format.
///
/// `archflow_<metric>{…} <value> <timestamp_ms>`; counters keep their
/// `_total` suffix, series stats fan out to `_count`, `_sum`, `_min`,
/// `_max`, `_avg`.
#[must_use]
pub fn encode_prometheus(snapshot: &MetricsSnapshot) -> String {
    let ts = snapshot.timestamp.timestamp_millis();
    let mut out = String::new();
    for (name, value) in &snapshot.counters {
        out.push_str(&format!("{name} {value} {ts}\n"));
    }
    for (name, value) in &snapshot.values {
        out.push_str(&format!("{name} {value} {ts}\n"));
    }
    for (name, stats) in &snapshot.stats {
        out.push_str(&format!("{name}_count {} {ts}\n", stats.count));
        out.push_str(&format!("{name}_sum {} {ts}\n", stats.sum));
        out.push_str(&format!("{name}_min {} {ts}\n", stats.min));
        out.push_str(&format!("{name}_max {} {ts}\n", stats.max));
        out.push_str(&format!("{name}_avg {} {ts}\n", stats.mean));
    }
    out
}

/// Encode a snapshot in InfluxDB line protocol.
#[must_use]
pub fn encode_influx(snapshot: &MetricsSnapshot) -> String {
    let ts_ns = snapshot.timestamp.timestamp_nanos_opt().unwrap_or_default();
    let mut out = String::new();
    for (name, value) in &snapshot.counters {
        out.push_str(&format!("archflow_counter,metric={name} value={value} {ts_ns}\n"));
    }
    for (name, value) in &snapshot.values {
        out.push_str(&format!("archflow_gauge,metric={name} value={value} {ts_ns}\n"));
    }
    for (name, stats) in &snapshot.stats {
        out.push_str(&format!(
            "archflow_stat,metric={name} count={},sum={},min={},max={},avg={} {ts_ns}\n",
            stats.count, stats.sum, stats.min, stats.max, stats.mean
        ));
    }
    out
}

/// Exporter that writes snapshots to the log.
pub struct LogExporter;

#[async_trait]
impl MetricsExporter for LogExporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError> {
        let json = serde_json::to_string(snapshot)?;
        tracing::info!(target: "archflow::metrics", snapshot = %json, "metrics snapshot");
        Ok(())
    }
}

/// Prometheus text exporter. Pushes to `url` when configured, otherwise logs
/// the exposition text.
pub struct PrometheusExporter {
    url: Option<String>,
    client: reqwest::Client,
}

impl PrometheusExporter {
    /// Create an exporter, optionally pushing to a gateway URL.
    #[must_use]
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetricsExporter for PrometheusExporter {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError> {
        let body = encode_prometheus(snapshot);
        match &self.url {
            Some(url) => {
                self.client
                    .post(url)
                    .body(body)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            None => {
                tracing::info!(target: "archflow::metrics", exposition = %body, "metrics snapshot");
            }
        }
        Ok(())
    }
}

/// InfluxDB line-protocol exporter.
pub struct InfluxExporter {
    url: Option<String>,
    client: reqwest::Client,
}

impl InfluxExporter {
    /// Create an exporter, optionally pushing to an Influx write URL.
    #[must_use]
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetricsExporter for InfluxExporter {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError> {
        let body = encode_influx(snapshot);
        match &self.url {
            Some(url) => {
                self.client
                    .post(url)
                    .body(body)
                    .send()
                    .await?
                    .error_for_status()?;
            }
            None => {
                tracing::info!(target: "archflow::metrics", lines = %body, "metrics snapshot");
            }
        }
        Ok(())
    }
}

/// JSON-over-HTTP exporter.
pub struct HttpExporter {
    url: String,
    client: reqwest::Client,
}

impl HttpExporter {
    /// Create an exporter pushing JSON snapshots to `url`.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetricsExporter for HttpExporter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError> {
        self.client
            .post(&self.url)
            .json(snapshot)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
