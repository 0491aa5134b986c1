//! Stackshift - dependency-ordered provisioning and blue/green cutover
//!
//! The member crates carry the engine; this crate adds configuration,
//! tracing setup and the [`Orchestrator`] control surface.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod telemetry;

pub use config::{LoggingConfig, StackshiftConfig, StoreBackend, StoreConfig, CONFIG_ENV};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use telemetry::init_tracing;
