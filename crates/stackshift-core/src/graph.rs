//! Dependency graph
//!
//! Nodes keyed by `(kind, name)` plus "depends on" edges. An edge `from -> to`
//! means `from` requires `to` to exist first. Every mutation keeps the graph a
//! DAG; a rejected mutation leaves it untouched.

use crate::error::{Error, Result};
use crate::resource::{ResourceId, ResourceNode, ResourceStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceId, ResourceNode>,
    /// from -> nodes it depends on
    dependencies: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// to -> nodes that depend on it
    dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Nodes in ascending `(kind, name)` order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.nodes.keys()
    }

    /// All edges as `(from, to)`, sorted.
    pub fn edges(&self) -> impl Iterator<Item = (&ResourceId, &ResourceId)> {
        self.dependencies
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from, to)))
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    pub fn dependencies_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    pub fn dependents_of(&self, id: &ResourceId) -> impl Iterator<Item = &ResourceId> {
        self.dependents.get(id).into_iter().flatten()
    }

    pub fn add_node(&mut self, node: ResourceNode) -> Result<()> {
        if self.nodes.contains_key(node.id()) {
            return Err(Error::DuplicateNode(node.id().clone()));
        }
        let id = node.id().clone();
        self.dependencies.insert(id.clone(), BTreeSet::new());
        self.dependents.insert(id.clone(), BTreeSet::new());
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Record that `from` depends on `to`.
    pub fn add_edge(&mut self, from: &ResourceId, to: &ResourceId) -> Result<()> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(Error::UnknownNode(id.clone()));
            }
        }
        if let Some(path) = self.dependency_path(to, from) {
            let mut involved = Vec::with_capacity(path.len() + 1);
            involved.push(from.clone());
            involved.extend(path);
            return Err(Error::Cycle { involved });
        }
        self.insert_edge(from, to);
        Ok(())
    }

    fn insert_edge(&mut self, from: &ResourceId, to: &ResourceId) {
        self.dependencies
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.dependents
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &ResourceId) -> Option<ResourceNode> {
        let node = self.nodes.remove(id)?;
        for to in self.dependencies.remove(id).unwrap_or_default() {
            if let Some(set) = self.dependents.get_mut(&to) {
                set.remove(id);
            }
        }
        for from in self.dependents.remove(id).unwrap_or_default() {
            if let Some(set) = self.dependencies.get_mut(&from) {
                set.remove(id);
            }
        }
        Some(node)
    }

    pub fn set_status(&mut self, id: &ResourceId, status: ResourceStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.clone()))?;
        node.set_status(status);
        Ok(())
    }

    /// Fold resulting statuses back into the graph. `Deleted` nodes leave it.
    pub fn apply_statuses<'a>(
        &mut self,
        statuses: impl IntoIterator<Item = (&'a ResourceId, ResourceStatus)>,
    ) {
        for (id, status) in statuses {
            if status == ResourceStatus::Deleted {
                self.remove_node(id);
            } else if let Some(node) = self.nodes.get_mut(id) {
                node.set_status(status);
            }
        }
    }

    /// Path `start -> ... -> target` following dependency edges, if any.
    fn dependency_path(&self, start: &ResourceId, target: &ResourceId) -> Option<Vec<ResourceId>> {
        let mut parent: BTreeMap<&ResourceId, &ResourceId> = BTreeMap::new();
        let mut seen: BTreeSet<&ResourceId> = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if current == target {
                let mut path = vec![current.clone()];
                let mut cursor = current;
                while let Some(prev) = parent.get(cursor) {
                    path.push((*prev).clone());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.dependencies_of(current) {
                if seen.insert(next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Lazy Kahn ordering: every node comes after all nodes it depends on.
    /// Ties are broken by ascending `(kind, name)`.
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        TopologicalOrder::new(self)
    }

    /// Collected [`DependencyGraph::topological_order`].
    pub fn topological_sort(&self) -> Result<Vec<&ResourceNode>> {
        self.topological_order().collect()
    }

    /// Ids of everything `id` transitively depends on (excluding `id`).
    pub fn transitive_dependencies(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.closure(id, |g, n| g.dependencies.get(n))
    }

    /// Ids of everything that transitively depends on `id` (excluding `id`).
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.closure(id, |g, n| g.dependents.get(n))
    }

    fn closure<'a, F>(&'a self, id: &ResourceId, next: F) -> BTreeSet<ResourceId>
    where
        F: Fn(&'a Self, &ResourceId) -> Option<&'a BTreeSet<ResourceId>>,
    {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&ResourceId> = next(self, id).into_iter().flatten().collect();
        while let Some(current) = stack.pop() {
            if out.insert(current.clone()) {
                stack.extend(next(self, current).into_iter().flatten());
            }
        }
        out.remove(id);
        out
    }

    /// `id` plus everything it transitively depends on, with induced edges.
    pub fn subgraph_rooted_at(&self, id: &ResourceId) -> Result<DependencyGraph> {
        if !self.contains(id) {
            return Err(Error::UnknownNode(id.clone()));
        }
        let mut members = self.transitive_dependencies(id);
        members.insert(id.clone());
        Ok(self.induced(&members))
    }

    /// `id` plus everything that transitively depends on it (blast radius).
    pub fn subgraph_dependents_of(&self, id: &ResourceId) -> Result<DependencyGraph> {
        if !self.contains(id) {
            return Err(Error::UnknownNode(id.clone()));
        }
        let mut members = self.transitive_dependents(id);
        members.insert(id.clone());
        Ok(self.induced(&members))
    }

    fn induced(&self, members: &BTreeSet<ResourceId>) -> DependencyGraph {
        let mut sub = DependencyGraph::new();
        for id in members {
            if let Some(node) = self.nodes.get(id) {
                sub.dependencies.insert(id.clone(), BTreeSet::new());
                sub.dependents.insert(id.clone(), BTreeSet::new());
                sub.nodes.insert(id.clone(), node.clone());
            }
        }
        for (from, to) in self.edges() {
            if members.contains(from) && members.contains(to) {
                sub.insert_edge(from, to);
            }
        }
        sub
    }

    /// Copy with every name prefixed by `prefix-`. Edges are carried over.
    pub fn namespaced(&self, prefix: &str) -> DependencyGraph {
        let mut out = DependencyGraph::new();
        for node in self.nodes.values() {
            let id = node.id().with_name_prefix(prefix);
            out.dependencies.insert(id.clone(), BTreeSet::new());
            out.dependents.insert(id.clone(), BTreeSet::new());
            out.nodes.insert(id.clone(), node.renamed(id));
        }
        for (from, to) in self.edges() {
            out.insert_edge(&from.with_name_prefix(prefix), &to.with_name_prefix(prefix));
        }
        out
    }

    /// Copy with the base tags merged into every node (see [`ResourceNode::with_tags`]).
    pub fn tagged(&self, base: &BTreeMap<String, String>) -> DependencyGraph {
        let mut out = self.clone();
        for node in out.nodes.values_mut() {
            *node = node.clone().with_tags(base);
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn insert_edge_unchecked(&mut self, from: &ResourceId, to: &ResourceId) {
        self.insert_edge(from, to);
    }
}

// ---------------------------------------------------------------------------
// Topological order
// ---------------------------------------------------------------------------

/// Iterator returned by [`DependencyGraph::topological_order`].
///
/// Yields `Err(Error::Cycle)` once, after the last orderable node, if any
/// nodes remain with unsatisfied dependencies.
pub struct TopologicalOrder<'a> {
    graph: &'a DependencyGraph,
    pending: BTreeMap<&'a ResourceId, usize>,
    ready: BTreeSet<&'a ResourceId>,
    finished: bool,
}

impl<'a> TopologicalOrder<'a> {
    fn new(graph: &'a DependencyGraph) -> Self {
        let mut pending = BTreeMap::new();
        let mut ready = BTreeSet::new();
        for id in graph.nodes.keys() {
            let in_degree = graph.dependencies.get(id).map_or(0, BTreeSet::len);
            if in_degree == 0 {
                ready.insert(id);
            } else {
                pending.insert(id, in_degree);
            }
        }
        Self {
            graph,
            pending,
            ready,
            finished: false,
        }
    }
}

impl<'a> Iterator for TopologicalOrder<'a> {
    type Item = Result<&'a ResourceNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let graph = self.graph;
        if let Some(id) = self.ready.pop_first() {
            for dependent in graph.dependents_of(id) {
                if let Some(count) = self.pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending.remove(dependent);
                        self.ready.insert(dependent);
                    }
                }
            }
            return graph.nodes.get(id).map(Ok);
        }
        self.finished = true;
        if self.pending.is_empty() {
            None
        } else {
            let involved = self.pending.keys().map(|id| (*id).clone()).collect();
            Some(Err(Error::Cycle { involved }))
        }
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// Flat `{nodes, edges}` document. Loading replays `add_node`/`add_edge`, so
/// duplicate ids, dangling edges and cycles are rejected.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<ResourceNode>,
    #[serde(default)]
    pub edges: Vec<EdgeDocument>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDocument {
    pub from: ResourceId,
    pub to: ResourceId,
}

impl TryFrom<GraphDocument> for DependencyGraph {
    type Error = Error;

    fn try_from(doc: GraphDocument) -> Result<Self> {
        let mut graph = DependencyGraph::new();
        for node in doc.nodes {
            graph.add_node(node)?;
        }
        for edge in &doc.edges {
            graph.add_edge(&edge.from, &edge.to)?;
        }
        Ok(graph)
    }
}

impl From<DependencyGraph> for GraphDocument {
    fn from(graph: DependencyGraph) -> Self {
        let edges = graph
            .edges()
            .map(|(from, to)| EdgeDocument {
                from: from.clone(),
                to: to.clone(),
            })
            .collect();
        Self {
            nodes: graph.nodes.into_values().collect(),
            edges,
        }
    }
}
