//! Scheduler configuration
//!
//! Concurrency limits, per-operation timeout and retry backoff. Loaded as
//! the `[scheduler]` and `[retry]` sections of the workspace config.

use serde::{Deserialize, Serialize};
use stackshift_core::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// Kinds that mutate shared network topology. Serialized by default.
pub const NETWORK_KINDS: &[&str] = &[
    "vpc",
    "subnet",
    "route_table",
    "route_table_association",
    "internet_gateway",
    "nat_gateway",
    "security_group",
    "network",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global cap on operations talking to the executor at once.
    pub max_concurrency: usize,
    /// Per-kind caps. Kinds not listed are bounded only by the global cap.
    pub kind_limits: BTreeMap<String, usize>,
    /// Upper bound on a single `apply`/`observe` call. A timeout is retryable.
    pub operation_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            kind_limits: NETWORK_KINDS.iter().map(|k| (k.to_string(), 1)).collect(),
            operation_timeout_ms: 300_000,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::validation("scheduler.max_concurrency must be at least 1"));
        }
        if let Some((kind, _)) = self.kind_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(Error::validation(format!(
                "scheduler.kind_limits.{kind} must be at least 1"
            )));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::validation("scheduler.operation_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn kind_limit(&self, kind: &str) -> Option<usize> {
        self.kind_limits.get(kind).copied()
    }

    /// Builder-style override used by callers and tests.
    pub fn with_kind_limit(mut self, kind: impl Into<String>, limit: usize) -> Self {
        self.kind_limits.insert(kind.into(), limit);
        self
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("retry.max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(Error::validation("retry.multiplier must be >= 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::validation(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let ms = (self.initial_backoff_ms as f64 * self.multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}
