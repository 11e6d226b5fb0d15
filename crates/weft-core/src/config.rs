use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// A node entered more often than this fails the workflow.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_node_visits: default_max_node_visits(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_node_visits() -> u32 { 5 }
fn default_event_capacity() -> usize { 256 }

/// How failed node executions are retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `delay(n) = min(base * 2^n, cap)`
    #[default]
    ExponentialBackoff,
    /// Always `base`.
    FixedDelay,
    /// Zero delay.
    Immediate,
    /// Fail on the first error.
    NoRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub strategy: RetryStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Scale each delay by a random factor in [0.8, 1.2].
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: false,
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> u64 { 1000 }
fn default_max_delay() -> u64 { 30000 }

impl RetryPolicy {
    pub fn exponential(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            strategy: RetryStrategy::ExponentialBackoff,
            max_retries,
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: cap.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            strategy: RetryStrategy::FixedDelay,
            max_retries,
            base_delay_ms: delay.as_millis() as u64,
            max_delay_ms: delay.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn immediate(max_retries: u32) -> Self {
        Self {
            strategy: RetryStrategy::Immediate,
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            strategy: RetryStrategy::NoRetry,
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Retries this policy permits. NO_RETRY permits none regardless of `max_retries`.
    pub fn retry_limit(&self) -> u32 {
        match self.strategy {
            RetryStrategy::NoRetry => 0,
            _ => self.max_retries,
        }
    }

    /// Delay before retry number `n` (0-based), without jitter.
    pub fn base_delay(&self, n: u32) -> Duration {
        let ms = match self.strategy {
            RetryStrategy::ExponentialBackoff => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(n))
                .min(self.max_delay_ms),
            RetryStrategy::FixedDelay => self.base_delay_ms,
            RetryStrategy::Immediate | RetryStrategy::NoRetry => 0,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Policy for nodes without an override.
    #[serde(default)]
    pub default: RetryPolicy,
    /// Per-node overrides keyed by node (or parallel task) name.
    #[serde(default)]
    pub nodes: HashMap<String, RetryPolicy>,
}

/// What happens when a review deadline passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Fail the workflow with reason `human_review_timeout`.
    #[default]
    Fail,
    AutoApprove,
    AutoReject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Used when a review node does not set its own timeout.
    #[serde(default = "default_review_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_review_timeout(),
            on_timeout: TimeoutAction::default(),
        }
    }
}

fn default_review_timeout() -> u64 { 86_400 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Choices below this confidence are flagged in the routing history.
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: default_low_confidence_threshold(),
        }
    }
}

fn default_low_confidence_threshold() -> f64 { 0.6 }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading engine config");
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let threshold = self.routing.low_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(WeftError::Config(format!(
                "routing.low_confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.executor.max_node_visits == 0 {
            return Err(WeftError::Config(
                "executor.max_node_visits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
