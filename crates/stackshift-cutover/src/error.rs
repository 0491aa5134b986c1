//! Error types for cutover orchestration

use crate::session::{CutoverState, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CutoverError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: CutoverState, to: CutoverState },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("graph error: {0}")]
    Graph(#[from] stackshift_core::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CutoverError>;

impl CutoverError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}
