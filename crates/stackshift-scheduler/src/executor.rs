//! Executor abstraction: the only place side effects happen.
//!
//! The scheduler and the cutover machine never talk to a provider directly.
//! They hand one operation at a time to an [`Executor`], which maps it onto
//! whatever backend is behind it (cloud API, simulator, dry run).

use serde::{Deserialize, Serialize};
use stackshift_core::{Operation, OperationKind, Properties, ResourceId, ResourceNode};
use thiserror::Error;

/// Result of applying a single operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "lowercase")]
pub enum ApplyOutcome {
    Succeeded,
    /// Transient failure; the scheduler backs off and tries again.
    Retryable(String),
    /// Permanent failure; dependents are skipped.
    Failed(String),
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Current backend state of a resource.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Present(Properties),
    NotFound,
}

impl Observation {
    /// Whether the backend already matches what `op` would produce.
    pub fn satisfies(&self, op: &Operation) -> bool {
        match (op.kind, self) {
            (OperationKind::Create | OperationKind::Update, Self::Present(props)) => {
                props == op.node.properties()
            }
            (OperationKind::Delete, Self::NotFound) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("traffic weight {0} is out of range 0..=100")]
    InvalidWeight(u8),

    #[error("unknown traffic target {stack} on {load_balancer}")]
    UnknownTarget {
        load_balancer: ResourceId,
        stack: String,
    },
}

/// Capability interface to a real backend.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Apply one create/update/delete.
    async fn apply(&self, op: &Operation) -> ApplyOutcome;

    /// Read the backend's view of a node.
    async fn observe(&self, node: &ResourceNode) -> Result<Observation, ExecutorError>;

    /// Route `weight` percent of `load_balancer` traffic to `stack_id`.
    async fn set_traffic_weight(
        &self,
        load_balancer: &ResourceId,
        stack_id: &str,
        weight: u8,
    ) -> Result<(), ExecutorError>;
}
