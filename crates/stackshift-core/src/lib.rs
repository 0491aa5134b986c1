//! Stackshift Core - resource model, dependency graph and plan compiler
//!
//! Everything in this crate is pure: building graphs and compiling plans
//! never touches a backend.

pub mod error;
pub mod graph;
pub mod plan;
pub mod resource;

pub use error::{Error, Result};
pub use graph::{DependencyGraph, GraphDocument, TopologicalOrder};
pub use plan::{
    compile, Operation, OperationId, OperationKind, Plan, PlanSummary, PropertyChange,
};
pub use resource::{Properties, ResourceId, ResourceNode, ResourceStatus};
