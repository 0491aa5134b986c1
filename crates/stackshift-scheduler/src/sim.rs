//! In-memory simulated backend
//!
//! An [`Executor`] that keeps resources and traffic weights in memory. Apply
//! outcomes can be scripted per resource to exercise retries, permanent
//! failures and timeouts without a real provider.

use crate::executor::{ApplyOutcome, Executor, ExecutorError, Observation};
use dashmap::DashMap;
use stackshift_core::{DependencyGraph, Operation, OperationKind, Properties, ResourceId, ResourceNode};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    pub kind: OperationKind,
    pub resource: ResourceId,
    pub outcome: ApplyOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightChange {
    pub load_balancer: ResourceId,
    pub stack: String,
    pub weight: u8,
}

pub struct InMemoryBackend {
    name: String,
    latency: Duration,
    resources: DashMap<ResourceId, Properties>,
    scripts: DashMap<ResourceId, VecDeque<ApplyOutcome>>,
    delays: DashMap<ResourceId, Duration>,
    weights: DashMap<(ResourceId, String), u8>,
    failing_weights: DashMap<String, String>,
    journal: Mutex<Vec<JournalEntry>>,
    weight_log: Mutex<Vec<WeightChange>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            name: "in-memory".into(),
            latency: Duration::from_millis(10),
            resources: DashMap::new(),
            scripts: DashMap::new(),
            delays: DashMap::new(),
            weights: DashMap::new(),
            failing_weights: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            weight_log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulated time every `apply` takes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Mark every node of `graph` as already present.
    pub fn seed(&self, graph: &DependencyGraph) {
        for node in graph.nodes() {
            self.resources.insert(node.id().clone(), node.properties().clone());
        }
    }

    /// Queue outcomes for the next `apply` calls on `resource`. Once the
    /// script is exhausted, applies succeed.
    pub fn script(&self, resource: ResourceId, outcomes: impl IntoIterator<Item = ApplyOutcome>) {
        self.scripts.entry(resource).or_default().extend(outcomes);
    }

    pub fn fail_transiently(&self, resource: ResourceId, times: usize, error: &str) {
        self.script(
            resource,
            std::iter::repeat_with(|| ApplyOutcome::Retryable(error.to_string())).take(times),
        );
    }

    pub fn fail_permanently(&self, resource: ResourceId, error: &str) {
        self.script(resource, [ApplyOutcome::Failed(error.to_string())]);
    }

    /// Extra time `apply` on `resource` takes, on top of the base latency.
    pub fn delay(&self, resource: ResourceId, extra: Duration) {
        self.delays.insert(resource, extra);
    }

    /// Reject every weight change targeting `stack`.
    pub fn fail_weights_for(&self, stack: &str, error: &str) {
        self.failing_weights.insert(stack.to_string(), error.to_string());
    }

    pub fn contains(&self, resource: &ResourceId) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn properties(&self, resource: &ResourceId) -> Option<Properties> {
        self.resources.get(resource).map(|p| p.clone())
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Resources whose `apply` succeeded, in completion order.
    pub fn applied(&self) -> Vec<ResourceId> {
        self.journal()
            .into_iter()
            .filter(|e| e.outcome.is_success())
            .map(|e| e.resource)
            .collect()
    }

    pub fn apply_count(&self, resource: &ResourceId) -> usize {
        self.journal().iter().filter(|e| &e.resource == resource).count()
    }

    pub fn weight(&self, load_balancer: &ResourceId, stack: &str) -> Option<u8> {
        self.weights
            .get(&(load_balancer.clone(), stack.to_string()))
            .map(|w| *w)
    }

    /// Current weights on `load_balancer`, by stack.
    pub fn weights(&self, load_balancer: &ResourceId) -> BTreeMap<String, u8> {
        self.weights
            .iter()
            .filter(|e| &e.key().0 == load_balancer)
            .map(|e| (e.key().1.clone(), *e.value()))
            .collect()
    }

    pub fn weight_changes(&self) -> Vec<WeightChange> {
        self.weight_log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Highest number of concurrent `apply` calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, entry: JournalEntry) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(entry);
        }
    }

    fn next_outcome(&self, resource: &ResourceId) -> ApplyOutcome {
        self.scripts
            .get_mut(resource)
            .and_then(|mut script| script.pop_front())
            .unwrap_or(ApplyOutcome::Succeeded)
    }
}

#[async_trait::async_trait]
impl Executor for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, op: &Operation) -> ApplyOutcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let extra = self.delays.get(op.resource()).map(|d| *d).unwrap_or_default();
        tokio::time::sleep(self.latency + extra).await;

        let outcome = self.next_outcome(op.resource());
        if outcome.is_success() {
            match op.kind {
                OperationKind::Create | OperationKind::Update => {
                    self.resources
                        .insert(op.resource().clone(), op.node.properties().clone());
                }
                OperationKind::Delete => {
                    self.resources.remove(op.resource());
                }
            }
        }
        debug!(op = %op.id, resource = %op.resource(), ?outcome, "simulated apply");
        self.record(JournalEntry {
            kind: op.kind,
            resource: op.resource().clone(),
            outcome: outcome.clone(),
        });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn observe(&self, node: &ResourceNode) -> Result<Observation, ExecutorError> {
        Ok(match self.resources.get(node.id()) {
            Some(props) => Observation::Present(props.clone()),
            None => Observation::NotFound,
        })
    }

    async fn set_traffic_weight(
        &self,
        load_balancer: &ResourceId,
        stack_id: &str,
        weight: u8,
    ) -> Result<(), ExecutorError> {
        if weight > 100 {
            return Err(ExecutorError::InvalidWeight(weight));
        }
        if let Some(error) = self.failing_weights.get(stack_id) {
            return Err(ExecutorError::Backend(error.clone()));
        }
        self.weights
            .insert((load_balancer.clone(), stack_id.to_string()), weight);
        if let Ok(mut log) = self.weight_log.lock() {
            log.push(WeightChange {
                load_balancer: load_balancer.clone(),
                stack: stack_id.to_string(),
                weight,
            });
        }
        Ok(())
    }
}
