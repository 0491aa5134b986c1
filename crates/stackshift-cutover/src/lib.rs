//! Stackshift Cutover - blue/green stacks, health-gated traffic shifting, rollback

pub mod config;
pub mod error;
pub mod health;
pub mod machine;
pub mod session;
pub mod stack;
pub mod store;

pub use config::CutoverConfig;
pub use error::{CutoverError, Result};
pub use health::{HealthProbe, HealthStatus, ScriptedProbe};
pub use machine::CutoverMachine;
pub use session::{BlueRetirement, CutoverSession, CutoverState, SessionId, Signal, Transition};
pub use stack::{Stack, StackColor, StackId};
pub use store::{FileStore, MemoryStore, SessionStore};
