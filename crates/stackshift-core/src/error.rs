//! Error types for graph construction and planning

use crate::resource::ResourceId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate node: {0}")]
    DuplicateNode(ResourceId),

    #[error("unknown node: {0}")]
    UnknownNode(ResourceId),

    #[error("cycle detected: {}", format_ids(.involved))]
    Cycle { involved: Vec<ResourceId> },

    #[error("plan conflict between operations on: {}", format_ids(.involved))]
    PlanConflict { involved: Vec<ResourceId> },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Graph construction errors are surfaced immediately and never retried.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode(_) | Self::UnknownNode(_) | Self::Cycle { .. }
        )
    }
}

fn format_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
