//! Engine configuration types.
//!
//! `EngineConfig` mirrors `engine.toml` in the data directory. Every field has
//! a default, so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Step ceiling for definitions that do not set their own.
    #[serde(default = "default_step_limit")]
    pub default_step_limit: u32,
    /// Instances allowed to step concurrently.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_step_limit() -> u32 {
    50
}

fn default_worker_pool_size() -> usize {
    16
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_limit: default_step_limit(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Child instances allowed to run concurrently across all fan-outs.
    #[serde(default = "default_fanout_concurrency")]
    pub max_concurrency: usize,
}

fn default_fanout_concurrency() -> usize {
    4
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_fanout_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Unchanged polls before a watch becomes a technical escalation.
    #[serde(default = "default_watch_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_watches")]
    pub max_watches: usize,
    /// Tool queried for external status.
    #[serde(default = "default_status_tool")]
    pub status_tool: String,
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_max_interval_secs() -> u64 {
    300
}

fn default_watch_max_attempts() -> u32 {
    5
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_watches() -> usize {
    1024
}

fn default_status_tool() -> String {
    "check_status".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_backoff_base_secs(),
            max_interval_secs: default_max_interval_secs(),
            max_attempts: default_watch_max_attempts(),
            tick_interval_ms: default_tick_interval_ms(),
            max_watches: default_max_watches(),
            status_tool: default_status_tool(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_reasoning_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_reasoning_attempts() -> u32 {
    3
}

fn default_reasoning_timeout_secs() -> u64 {
    20
}

fn default_reasoning_backoff_ms() -> u64 {
    250
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reasoning_attempts(),
            timeout_secs: default_reasoning_timeout_secs(),
            retry_backoff_ms: default_reasoning_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_tool_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_tool_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_tool_attempts() -> u32 {
    3
}

fn default_tool_backoff_ms() -> u64 {
    200
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_tool_attempts(),
            retry_backoff_ms: default_tool_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Threshold for decision points that do not set their own.
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
}

fn default_threshold() -> f64 {
    0.7
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.executor.default_step_limit == 0 {
            return Err("executor.default_step_limit must be greater than 0".to_string());
        }
        if self.executor.worker_pool_size == 0 {
            return Err("executor.worker_pool_size must be greater than 0".to_string());
        }
        if self.fanout.max_concurrency == 0 {
            return Err("fanout.max_concurrency must be greater than 0".to_string());
        }
        if self.watch.backoff_base_secs == 0 {
            return Err("watch.backoff_base_secs must be greater than 0".to_string());
        }
        if self.watch.max_interval_secs < self.watch.backoff_base_secs {
            return Err("watch.max_interval_secs must be at least backoff_base_secs".to_string());
        }
        if self.watch.max_attempts == 0 {
            return Err("watch.max_attempts must be greater than 0".to_string());
        }
        if self.reasoning.max_attempts == 0 || self.tools.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.decision.default_threshold) {
            return Err("decision.default_threshold must be within [0, 1]".to_string());
        }
        Ok(())
    }
}
