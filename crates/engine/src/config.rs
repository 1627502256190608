//! Engine configuration.

use serde::{Deserialize, Serialize};

use archflow_resilience::RetryConfig;

/// Engine-level options (`flow.*` / `resources.*` configuration keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the shared step worker pool across all runs.
    pub max_concurrent: usize,
    /// Default per-step deadline when a step declares none.
    pub default_step_timeout_ms: u64,
    /// Default whole-run deadline when a workflow declares none.
    pub default_flow_timeout_ms: u64,
    /// Default retry parameters for workflows assembled from configuration.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: std::thread::available_parallelism().map_or(4, usize::from),
            default_step_timeout_ms: 30_000,
            default_flow_timeout_ms: 300_000,
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent >= 1);
        assert_eq!(config.default_step_timeout_ms, 30_000);
        assert_eq!(config.default_flow_timeout_ms, 300_000);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn partial_toml_style_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent": 2}"#).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.default_step_timeout_ms, 30_000);
    }
}
