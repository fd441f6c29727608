//! Engine configuration and per-run options.

use crate::step::RetryConfig;
use crate::template::DEFAULT_CACHE_CAPACITY;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Scheduling strategy for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Steps run one at a time in declaration order.
    #[default]
    Sequential,
    /// Dependency batches, each fanned out.
    Parallel,
    /// Dependency batches; chains of single-step batches run sequentially.
    Hybrid,
}

/// Options for one run. Checkpoints and rollback are opt-in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Deadline for the whole run, checked between steps and phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default)]
    pub enable_checkpoints: bool,

    #[serde(default)]
    pub enable_rollback: bool,

    /// Append an execution record to the store when the run ends.
    #[serde(default)]
    pub save_progress: bool,

    /// Copied into the run's variables as `session_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ExecuteOptions {
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn checkpoints(mut self, enabled: bool) -> Self {
        self.enable_checkpoints = enabled;
        self
    }

    pub fn rollback(mut self, enabled: bool) -> Self {
        self.enable_rollback = enabled;
        self
    }

    pub fn save_progress(mut self, enabled: bool) -> Self {
        self.save_progress = enabled;
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Engine-wide settings.
///
/// ```yaml
/// default_retry:
///   max_attempts: 5
///   retry_delay_ms: 250
/// template_cache_size: 200
/// max_concurrent_runs: 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Used by steps without their own `retry_config`.
    #[serde(default)]
    pub default_retry: RetryConfig,

    #[serde(default = "default_template_cache_size")]
    pub template_cache_size: usize,

    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

fn default_template_cache_size() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_max_concurrent_runs() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryConfig::default(),
            template_cache_size: default_template_cache_size(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse engine config YAML")
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse engine config: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_defaults() {
        let options: ExecuteOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ExecuteOptions::default());
        assert_eq!(options.execution_mode, ExecutionMode::Sequential);
        assert!(!options.enable_checkpoints);
        assert!(!options.enable_rollback);
        assert!(!options.save_progress);
    }

    #[test]
    fn test_option_parsing() {
        let options: ExecuteOptions = serde_json::from_str(
            r#"{"execution_mode": "hybrid", "timeout_ms": 5000, "enable_rollback": true}"#,
        )
        .unwrap();
        assert_eq!(options.execution_mode, ExecutionMode::Hybrid);
        assert_eq!(options.timeout_ms, Some(5000));
        assert!(options.enable_rollback);
        assert!(!options.enable_checkpoints);
    }

    #[test]
    fn test_engine_config_yaml() {
        let config = EngineConfig::from_yaml(
            r#"
default_retry:
  max_attempts: 5
  retry_delay_ms: 250
max_concurrent_runs: 4
"#,
        )
        .unwrap();

        assert_eq!(config.default_retry.max_attempts, 5);
        assert_eq!(config.default_retry.retry_delay_ms, 250);
        assert!(config.default_retry.exponential_backoff);
        assert_eq!(config.template_cache_size, 500);
        assert_eq!(config.max_concurrent_runs, 4);
    }

    #[test]
    fn test_engine_config_empty() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
