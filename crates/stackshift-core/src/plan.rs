//! Plan compiler
//!
//! Diffs a desired graph against an observed one and wires the resulting
//! operations into their own DAG. The plan keeps the DAG so the scheduler can
//! run independent branches concurrently; operations are additionally stored
//! in one deterministic linearization.

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::resource::{Properties, ResourceId, ResourceNode, ResourceStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Position of an operation in its plan's linearization.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub usize);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn symbol(&self) -> char {
        match self {
            Self::Create => '+',
            Self::Update => '~',
            Self::Delete => '-',
        }
    }

    /// Node status while the operation is running.
    pub fn in_flight_status(&self) -> ResourceStatus {
        match self {
            Self::Create => ResourceStatus::Creating,
            Self::Update => ResourceStatus::Updating,
            Self::Delete => ResourceStatus::Deleting,
        }
    }

    /// Node status once the operation succeeded.
    pub fn target_status(&self) -> ResourceStatus {
        match self {
            Self::Create | Self::Update => ResourceStatus::Ready,
            Self::Delete => ResourceStatus::Deleted,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One changed property on an update. `None` means absent on that side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub key: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl PropertyChange {
    fn diff(before: &Properties, after: &Properties) -> Vec<PropertyChange> {
        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let (b, a) = (before.get(key), after.get(key));
                (b != a).then(|| PropertyChange {
                    key: key.clone(),
                    before: b.cloned(),
                    after: a.cloned(),
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Desired node for create/update, observed node for delete.
    pub node: ResourceNode,
    /// Populated for updates only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<PropertyChange>,
    pub depends_on: BTreeSet<OperationId>,
}

impl Operation {
    pub fn resource(&self) -> &ResourceId {
        self.node.id()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl PlanSummary {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// Immutable set of operations forming a valid topological schedule.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    operations: Vec<Operation>,
    dependents: Vec<BTreeSet<OperationId>>,
}

impl Plan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in linearized order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(id.0)
    }

    pub fn find(&self, resource: &ResourceId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.resource() == resource)
    }

    /// Deterministic linearization. Every operation follows its `depends_on`.
    pub fn linearize(&self) -> Vec<OperationId> {
        self.operations.iter().map(|op| op.id).collect()
    }

    pub fn dependents_of(&self, id: OperationId) -> impl Iterator<Item = OperationId> + '_ {
        self.dependents.get(id.0).into_iter().flatten().copied()
    }

    /// Everything that transitively waits on `id`; the skip-set on failure.
    pub fn transitive_dependents(&self, id: OperationId) -> BTreeSet<OperationId> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<OperationId> = self.dependents_of(id).collect();
        while let Some(current) = stack.pop() {
            if out.insert(current) {
                stack.extend(self.dependents_of(current));
            }
        }
        out
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.kind {
                OperationKind::Create => summary.creates += 1,
                OperationKind::Update => summary.updates += 1,
                OperationKind::Delete => summary.deletes += 1,
            }
        }
        summary
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.summary();
        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to delete",
            s.creates, s.updates, s.deletes
        )?;
        for op in &self.operations {
            writeln!(f, "  {} {}", op.kind.symbol(), op.resource())?;
            for change in &op.changes {
                writeln!(
                    f,
                    "      {}: {} -> {}",
                    change.key,
                    render(change.before.as_ref()),
                    render(change.after.as_ref())
                )?;
            }
        }
        Ok(())
    }
}

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| "(none)".to_string(), Value::to_string)
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

struct Draft {
    kind: OperationKind,
    node: ResourceNode,
    changes: Vec<PropertyChange>,
    depends_on: BTreeSet<ResourceId>,
}

/// Compile the operations that move `observed` to `desired`.
///
/// Creates and updates wait for the creates/updates of their desired
/// dependencies. Deletes wait for the deletes of their observed dependents,
/// and for the update of any observed dependent that survives (it has to be
/// re-pointed first). An update waits for the delete of any observed
/// dependent that is going away. When those rules contradict each other the
/// plan is rejected with [`Error::PlanConflict`].
pub fn compile(desired: &DependencyGraph, observed: &DependencyGraph) -> Result<Plan> {
    let mut drafts: BTreeMap<ResourceId, Draft> = BTreeMap::new();

    for node in desired.nodes() {
        match observed.node(node.id()) {
            None => {
                drafts.insert(node.id().clone(), Draft::new(OperationKind::Create, node, Vec::new()));
            }
            Some(current) if current.properties() != node.properties() => {
                let changes = PropertyChange::diff(current.properties(), node.properties());
                drafts.insert(node.id().clone(), Draft::new(OperationKind::Update, node, changes));
            }
            Some(_) => {}
        }
    }
    for node in observed.nodes() {
        if !desired.contains(node.id()) {
            drafts.insert(node.id().clone(), Draft::new(OperationKind::Delete, node, Vec::new()));
        }
    }

    let kinds: BTreeMap<ResourceId, OperationKind> =
        drafts.iter().map(|(id, d)| (id.clone(), d.kind)).collect();
    let kind_of = |id: &ResourceId| kinds.get(id).copied();

    for (id, draft) in drafts.iter_mut() {
        match draft.kind {
            OperationKind::Create | OperationKind::Update => {
                for dep in desired.dependencies_of(id) {
                    if matches!(kind_of(dep), Some(OperationKind::Create | OperationKind::Update)) {
                        draft.depends_on.insert(dep.clone());
                    }
                }
                if draft.kind == OperationKind::Update {
                    for dependent in observed.dependents_of(id) {
                        if kind_of(dependent) == Some(OperationKind::Delete) {
                            draft.depends_on.insert(dependent.clone());
                        }
                    }
                }
            }
            OperationKind::Delete => {
                for dependent in observed.dependents_of(id) {
                    if matches!(kind_of(dependent), Some(OperationKind::Delete | OperationKind::Update)) {
                        draft.depends_on.insert(dependent.clone());
                    }
                }
            }
        }
    }

    let order = schedule(&drafts)?;
    let index: BTreeMap<&ResourceId, OperationId> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, OperationId(i)))
        .collect();

    let mut operations = Vec::with_capacity(order.len());
    let mut dependents = vec![BTreeSet::new(); order.len()];
    for (i, id) in order.iter().enumerate() {
        let draft = &drafts[*id];
        let depends_on: BTreeSet<OperationId> =
            draft.depends_on.iter().map(|dep| index[dep]).collect();
        for dep in &depends_on {
            dependents[dep.0].insert(OperationId(i));
        }
        operations.push(Operation {
            id: OperationId(i),
            kind: draft.kind,
            node: draft.node.clone(),
            changes: draft.changes.clone(),
            depends_on,
        });
    }

    let plan = Plan { operations, dependents };
    let summary = plan.summary();
    debug!(
        creates = summary.creates,
        updates = summary.updates,
        deletes = summary.deletes,
        "compiled plan"
    );
    Ok(plan)
}

impl Draft {
    fn new(kind: OperationKind, node: &ResourceNode, changes: Vec<PropertyChange>) -> Self {
        let mut node = node.clone();
        node.set_status(ResourceStatus::Planned);
        Self {
            kind,
            node,
            changes,
            depends_on: BTreeSet::new(),
        }
    }
}

/// Order drafts with the graph's own Kahn ordering. An operation cycle is a
/// plan conflict, reported with the cycle path.
fn schedule(drafts: &BTreeMap<ResourceId, Draft>) -> Result<Vec<&ResourceId>> {
    let mut order_graph = DependencyGraph::new();
    for draft in drafts.values() {
        order_graph.add_node(draft.node.clone())?;
    }
    for (id, draft) in drafts {
        for dep in &draft.depends_on {
            order_graph.add_edge(id, dep).map_err(|e| match e {
                Error::Cycle { involved } => Error::PlanConflict { involved },
                other => other,
            })?;
        }
    }
    let sorted = order_graph.topological_sort().map_err(|e| match e {
        Error::Cycle { involved } => Error::PlanConflict { involved },
        other => other,
    })?;
    Ok(sorted
        .into_iter()
        .filter_map(|node| drafts.get_key_value(node.id()).map(|(id, _)| id))
        .collect())
}
