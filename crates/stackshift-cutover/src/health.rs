//! Health probe interface and a scripted probe for simulation

use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::Unhealthy(reason.into())
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Polled by the cutover machine before every promotion step.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, stack: &Stack) -> HealthStatus;
}

/// Replays a fixed sequence of readings, then repeats `fallback`.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<HealthStatus>>,
    fallback: HealthStatus,
    readings: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(readings: impl IntoIterator<Item = HealthStatus>, fallback: HealthStatus) -> Self {
        Self {
            script: Mutex::new(readings.into_iter().collect()),
            fallback,
            readings: AtomicUsize::new(0),
        }
    }

    pub fn always(status: HealthStatus) -> Self {
        Self::new([], status)
    }

    pub fn always_healthy() -> Self {
        Self::always(HealthStatus::Healthy)
    }

    /// Number of `check` calls so far.
    pub fn readings_taken(&self) -> usize {
        self.readings.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, _stack: &Stack) -> HealthStatus {
        self.readings.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}
