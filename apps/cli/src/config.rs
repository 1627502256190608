//! Layered configuration: built-in defaults → `archflow.toml` → `ARCHFLOW_*`
//! environment variables.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use archflow_metrics::MetricsConfig;
use archflow_resilience::RetryConfig;
use archflow_streaming::StreamingConfig;

/// Agent identity and plugin discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identifier this engine instance reports.
    pub id: String,
    /// Directory scanned for workflow definition files at startup.
    pub plugins_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "archflow".into(),
            plugins_path: None,
        }
    }
}

/// Flow-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Cap on concurrently accepted runs (enforced by embedding services).
    pub max_concurrent: usize,
    /// Default whole-run deadline in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            default_timeout_ms: 300_000,
        }
    }
}

/// Host resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Size of the shared step worker pool.
    pub parallelism: usize,
    /// Advisory heap ceiling in bytes.
    pub max_heap_bytes: Option<u64>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map_or(4, usize::from),
            max_heap_bytes: None,
        }
    }
}

/// The full configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchflowConfig {
    /// `agent.*` options.
    pub agent: AgentConfig,
    /// `flow.*` options.
    pub flow: FlowConfig,
    /// `retry.*` options (engine-wide defaults).
    pub retry: RetryConfig,
    /// `resources.*` options.
    pub resources: ResourcesConfig,
    /// `metrics.*` options.
    pub metrics: MetricsConfig,
    /// `streaming.*` options.
    pub streaming: StreamingConfig,
}

impl ArchflowConfig {
    /// Load configuration, layering an optional TOML file and `ARCHFLOW_*`
    /// environment variables (nested keys split on `__`) over the defaults.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        } else {
            figment = figment.merge(Toml::file("archflow.toml"));
        }
        figment = figment.merge(Env::prefixed("ARCHFLOW_").split("__"));
        Ok(figment.extract()?)
    }
}
