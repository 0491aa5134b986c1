//! Resource node model
//!
//! A node is a value holder: identity, opaque properties and a lifecycle
//! status. Uniqueness is a graph concern and is checked on insertion.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Declared properties. Opaque to the engine, interpreted by the executor.
pub type Properties = BTreeMap<String, Value>;

/// `(kind, name)` identity. Orders by kind, then name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    kind: String,
    name: String,
}

impl ResourceId {
    /// Build an id without validation. Use [`ResourceId::parse`] or
    /// [`ResourceNode::new`] for untrusted input.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse `kind.name`. The kind never contains a dot; the name may.
    pub fn parse(address: &str) -> Result<Self> {
        let (kind, name) = address
            .split_once('.')
            .ok_or_else(|| Error::validation(format!("'{address}' is not a kind.name address")))?;
        let id = Self::new(kind, name);
        id.validate()?;
        Ok(id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(Error::validation("resource kind must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::validation(format!(
                "resource name must not be empty (kind '{}')",
                self.kind
            )));
        }
        if self.kind.contains('.') || self.kind.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "resource kind '{}' must not contain dots or whitespace",
                self.kind
            )));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "resource name '{}' must not contain whitespace",
                self.name
            )));
        }
        Ok(())
    }

    /// Same kind, name prefixed with `prefix-`.
    pub fn with_name_prefix(&self, prefix: &str) -> Self {
        Self::new(self.kind.clone(), format!("{prefix}-{}", self.name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// Lifecycle of a single resource as seen by the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Planned,
    Creating,
    Ready,
    Updating,
    Deleting,
    Deleted,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::Creating => write!(f, "creating"),
            Self::Ready => write!(f, "ready"),
            Self::Updating => write!(f, "updating"),
            Self::Deleting => write!(f, "deleting"),
            Self::Deleted => write!(f, "deleted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A single infrastructure resource declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NodeDocument", into = "NodeDocument")]
pub struct ResourceNode {
    id: ResourceId,
    properties: Properties,
    status: ResourceStatus,
}

impl ResourceNode {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        properties: Properties,
    ) -> Result<Self> {
        let id = ResourceId::new(kind, name);
        id.validate()?;
        Ok(Self {
            id,
            properties,
            status: ResourceStatus::Planned,
        })
    }

    /// Node with no properties.
    pub fn bare(kind: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Self::new(kind, name, Properties::new())
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        self.id.kind()
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Merge common tags with a `Name` tag into the `tags` property.
    /// Tags already declared on the node win over the base set.
    pub fn with_tags(mut self, base: &BTreeMap<String, String>) -> Self {
        let mut tags: serde_json::Map<String, Value> = base
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        tags.insert("Name".into(), Value::String(self.id.name().to_string()));
        if let Some(Value::Object(existing)) = self.properties.get("tags") {
            for (k, v) in existing {
                tags.insert(k.clone(), v.clone());
            }
        }
        self.properties.insert("tags".into(), Value::Object(tags));
        self
    }

    /// Same node under a new identity, status reset.
    pub(crate) fn renamed(&self, id: ResourceId) -> Self {
        Self {
            id,
            properties: self.properties.clone(),
            status: ResourceStatus::Planned,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct NodeDocument {
    kind: String,
    name: String,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    status: ResourceStatus,
}

impl TryFrom<NodeDocument> for ResourceNode {
    type Error = Error;

    fn try_from(doc: NodeDocument) -> Result<Self> {
        let mut node = ResourceNode::new(doc.kind, doc.name, doc.properties)?;
        node.status = doc.status;
        Ok(node)
    }
}

impl From<ResourceNode> for NodeDocument {
    fn from(node: ResourceNode) -> Self {
        Self {
            kind: node.id.kind,
            name: node.id.name,
            properties: node.properties,
            status: node.status,
        }
    }
}
