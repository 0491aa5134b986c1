//! Top-level error type

use stackshift_cutover::{CutoverError, SessionId, StackId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] stackshift_core::Error),

    #[error(transparent)]
    Cutover(#[from] CutoverError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no active stack; bootstrap one first")]
    NoActiveStack,

    #[error("stack {0} is already active")]
    AlreadyBootstrapped(StackId),

    #[error("cutover {0} is still running")]
    CutoverInProgress(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("provisioning failed: {0}")]
    Provisioning(String),
}

pub type Result<T> = std::result::Result<T, Error>;
