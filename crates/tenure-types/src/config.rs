//! Engine configuration types for tenure.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.tenure/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on steps a synchronously-driven child workflow may run.
    #[serde(default = "default_max_sub_workflow_iterations")]
    pub max_sub_workflow_iterations: u32,

    /// How many call_workflow levels may be nested below a top-level instance.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Steps a single engine call may run before the instance is failed.
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: u32,

    /// Timeout for webhook steps that do not set their own.
    #[serde(default = "default_webhook_timeout_ms")]
    pub default_webhook_timeout_ms: u64,

    /// What happens when a branch transition matches nothing and has no default.
    #[serde(default)]
    pub unmatched_branch: UnmatchedBranchPolicy,

    /// Batch size for parallel `for_each` steps without `max_concurrency`.
    #[serde(default = "default_for_each_concurrency")]
    pub default_for_each_concurrency: usize,

    /// Retry policy for process status sync callbacks.
    #[serde(default)]
    pub status_sync: RetryPolicy,

    /// Endpoint receiving process status changes. Sync is a no-op when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_callback_url: Option<String>,

    /// Base URL that `action` steps are POSTed to (`{base}/{action}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_base_url: Option<String>,
}

fn default_max_sub_workflow_iterations() -> u32 {
    100
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_max_steps_per_run() -> u32 {
    1000
}

fn default_webhook_timeout_ms() -> u64 {
    30_000
}

fn default_for_each_concurrency() -> usize {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sub_workflow_iterations: default_max_sub_workflow_iterations(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            max_steps_per_run: default_max_steps_per_run(),
            default_webhook_timeout_ms: default_webhook_timeout_ms(),
            unmatched_branch: UnmatchedBranchPolicy::default(),
            default_for_each_concurrency: default_for_each_concurrency(),
            status_sync: RetryPolicy::default(),
            sync_callback_url: None,
            action_base_url: None,
        }
    }
}

/// Behaviour when no branch matches and no default branch exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedBranchPolicy {
    /// Treat as workflow completion and log a warning.
    #[default]
    End,
    /// Fail the instance.
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_sub_workflow_iterations, 100);
        assert_eq!(config.max_sub_workflow_depth, 5);
        assert_eq!(config.max_steps_per_run, 1000);
        assert_eq!(config.default_webhook_timeout_ms, 30_000);
        assert_eq!(config.unmatched_branch, UnmatchedBranchPolicy::End);
        assert_eq!(config.default_for_each_concurrency, 5);
        assert_eq!(config.status_sync.max_retries, 3);
        assert!(config.sync_callback_url.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_sub_workflow_iterations, 100);
        assert_eq!(config.status_sync, RetryPolicy::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_sub_workflow_iterations = 25
max_steps_per_run = 200
unmatched_branch = "fail"
sync_callback_url = "https://hr.example.com/api/process-status"

[status_sync]
max_retries = 5
initial_delay_ms = 250
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_sub_workflow_iterations, 25);
        assert_eq!(config.max_steps_per_run, 200);
        assert_eq!(config.max_sub_workflow_depth, 5);
        assert_eq!(config.unmatched_branch, UnmatchedBranchPolicy::Fail);
        assert_eq!(config.status_sync.max_retries, 5);
        assert_eq!(config.status_sync.initial_delay_ms, 250);
        assert_eq!(config.status_sync.max_delay_ms, 10_000);
        assert_eq!(
            config.sync_callback_url.as_deref(),
            Some("https://hr.example.com/api/process-status")
        );
    }
}
