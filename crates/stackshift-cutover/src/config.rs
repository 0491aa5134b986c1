//! Cutover configuration
//!
//! The `[cutover]` section. Durations are milliseconds.

use crate::error::{CutoverError, Result};
use serde::{Deserialize, Serialize};
use stackshift_core::ResourceId;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CutoverConfig {
    /// Load balancer whose weighted targets are shifted, as `kind.name`.
    pub load_balancer: ResourceId,
    /// Consecutive healthy readings required before shifting traffic.
    pub healthy_threshold: u32,
    /// Consecutive unhealthy readings that abort the health gate.
    pub unhealthy_threshold: u32,
    /// Pause between health readings.
    pub check_interval_ms: u64,
    /// Readings allowed before the health gate gives up on green.
    pub max_health_checks: u32,
    /// Green weight after each step. Strictly increasing, ends at 100.
    pub traffic_steps: Vec<u8>,
    /// Pause between traffic steps.
    pub step_pause_ms: u64,
    /// Post-cutover validation window, probed every `check_interval_ms`.
    pub bake_window_ms: u64,
    /// Wait after promotion before blue is torn down.
    pub blue_termination_wait_ms: u64,
    /// Tags merged into every resource of a provisioned stack.
    pub tags: BTreeMap<String, String>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            load_balancer: ResourceId::new("load_balancer", "main"),
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            check_interval_ms: 15_000,
            max_health_checks: 40,
            traffic_steps: vec![10, 50, 100],
            step_pause_ms: 30_000,
            bake_window_ms: 60_000,
            blue_termination_wait_ms: 300_000,
            tags: BTreeMap::from([("ManagedBy".to_string(), "stackshift".to_string())]),
        }
    }
}

impl CutoverConfig {
    pub fn validate(&self) -> Result<()> {
        self.load_balancer
            .validate()
            .map_err(|e| CutoverError::config(format!("cutover.load_balancer: {e}")))?;
        if self.healthy_threshold == 0 || self.unhealthy_threshold == 0 {
            return Err(CutoverError::config(
                "cutover.healthy_threshold and cutover.unhealthy_threshold must be at least 1",
            ));
        }
        if self.max_health_checks < self.healthy_threshold {
            return Err(CutoverError::config(format!(
                "cutover.max_health_checks ({}) is below healthy_threshold ({})",
                self.max_health_checks, self.healthy_threshold
            )));
        }
        if self.check_interval_ms == 0 {
            return Err(CutoverError::config("cutover.check_interval_ms must be positive"));
        }
        let Some(&last) = self.traffic_steps.last() else {
            return Err(CutoverError::config("cutover.traffic_steps must not be empty"));
        };
        if last != 100 {
            return Err(CutoverError::config(format!(
                "cutover.traffic_steps must end at 100, got {last}"
            )));
        }
        if self.traffic_steps[0] == 0 || self.traffic_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CutoverError::config(format!(
                "cutover.traffic_steps must be strictly increasing within 1..=100, got {:?}",
                self.traffic_steps
            )));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }

    pub fn blue_termination_wait(&self) -> Duration {
        Duration::from_millis(self.blue_termination_wait_ms)
    }

    /// Validation readings over the bake window, at least one.
    pub fn bake_checks(&self) -> u64 {
        (self.bake_window_ms / self.check_interval_ms.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CutoverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bake_checks(), 4);
        assert_eq!(config.traffic_steps, vec![10, 50, 100]);
    }

    #[test]
    fn steps_must_increase_and_end_at_full_weight() {
        for steps in [vec![], vec![10, 50], vec![50, 10, 100], vec![0, 100], vec![10, 10, 100]] {
            let config = CutoverConfig {
                traffic_steps: steps.clone(),
                ..CutoverConfig::default()
            };
            assert!(config.validate().is_err(), "{steps:?} accepted");
        }
        let single = CutoverConfig {
            traffic_steps: vec![100],
            ..CutoverConfig::default()
        };
        assert!(single.validate().is_ok());
    }

    #[test]
    fn health_budget_must_cover_threshold() {
        let config = CutoverConfig {
            healthy_threshold: 5,
            max_health_checks: 3,
            ..CutoverConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_health_checks"));
    }

    #[test]
    fn short_bake_window_still_probes_once() {
        let config = CutoverConfig {
            bake_window_ms: 1_000,
            ..CutoverConfig::default()
        };
        assert_eq!(config.bake_checks(), 1);
    }
}
