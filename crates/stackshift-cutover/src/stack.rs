//! Blue and green stacks
//!
//! A stack is one full copy of the desired graph under its own id. Names are
//! prefixed with the stack id so both copies can exist side by side.

use serde::{Deserialize, Serialize};
use stackshift_core::DependencyGraph;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Stack identifier, `blue-xxxxxxxx` / `green-xxxxxxxx`. Cheaply cloneable.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StackId(Arc<str>);

impl StackId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// `<color>-` plus the first 8 hex chars of a v4 uuid.
    pub fn generate(color: StackColor) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("{color}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StackId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for StackId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<StackId> for String {
    fn from(id: StackId) -> Self {
        id.0.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackColor {
    Blue,
    Green,
}

impl fmt::Display for StackColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blue => write!(f, "blue"),
            Self::Green => write!(f, "green"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub color: StackColor,
    pub graph: DependencyGraph,
    /// Percent of load balancer traffic routed here, 0..=100.
    pub traffic_weight: u8,
}

impl Stack {
    /// New stack for `desired`: names prefixed with a fresh id, every node
    /// tagged with `tags` plus `Stack` and `Name`. Receives no traffic yet.
    pub fn provision(
        color: StackColor,
        desired: &DependencyGraph,
        tags: &BTreeMap<String, String>,
    ) -> Self {
        let id = StackId::generate(color);
        let mut tags = tags.clone();
        tags.insert("Stack".into(), id.to_string());
        let graph = desired.namespaced(id.as_str()).tagged(&tags);
        Self {
            id,
            color,
            graph,
            traffic_weight: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.traffic_weight > 0
    }
}
