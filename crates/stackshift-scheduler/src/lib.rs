//! Stackshift Scheduler - executor interface and concurrent plan execution

pub mod config;
pub mod executor;
pub mod scheduler;
pub mod sim;

pub use config::{RetryPolicy, SchedulerConfig, NETWORK_KINDS};
pub use executor::{ApplyOutcome, Executor, ExecutorError, Observation};
pub use scheduler::{
    FailureCause, OperationReport, OperationStatus, RunSummary, Scheduler, SchedulerEvent,
};
pub use sim::{InMemoryBackend, JournalEntry, WeightChange};
