//! Cutover session: state, transition history, stacks
//!
//! ```text
//! Initializing -> GreenProvisioning -> HealthChecking -> TrafficShifting -> Validating -> Promoted
//!                        |                   |                 |               |
//!                        +-------------------+--------+--------+---------------+
//!                                                     v
//!                                               RollingBack -> RolledBack
//! ```

use crate::error::{CutoverError, Result};
use crate::stack::Stack;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Session identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverState {
    Initializing,
    GreenProvisioning,
    HealthChecking,
    TrafficShifting,
    Validating,
    Promoted,
    RollingBack,
    RolledBack,
}

impl CutoverState {
    pub fn can_transition_to(&self, next: CutoverState) -> bool {
        use CutoverState::*;
        matches!(
            (*self, next),
            (Initializing, GreenProvisioning)
                | (GreenProvisioning, HealthChecking)
                | (HealthChecking, TrafficShifting)
                | (TrafficShifting, Validating)
                | (Validating, Promoted)
                | (GreenProvisioning | HealthChecking | TrafficShifting | Validating, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Promoted | Self::RolledBack)
    }
}

impl fmt::Display for CutoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::GreenProvisioning => write!(f, "green_provisioning"),
            Self::HealthChecking => write!(f, "health_checking"),
            Self::TrafficShifting => write!(f, "traffic_shifting"),
            Self::Validating => write!(f, "validating"),
            Self::Promoted => write!(f, "promoted"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// What triggered a transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    SessionCreated,
    GreenProvisioned { operations: usize },
    ProvisioningFailed { cause: String },
    HealthChecksPassed { consecutive: u32 },
    HealthCheckFailed { reason: String },
    HealthCheckTimeout { checks: u32 },
    TrafficShifted { green_weight: u8 },
    ValidationPassed { checks: u64 },
    ValidationFailed { reason: String },
    TrafficError { error: String },
    CancelRequested,
    /// Found mid-flight after a restart.
    Recovered,
    TrafficRestored,
    TrafficRestoreFailed { error: String },
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionCreated => write!(f, "session created"),
            Self::GreenProvisioned { operations } => {
                write!(f, "green provisioned ({operations} operations)")
            }
            Self::ProvisioningFailed { cause } => write!(f, "green provisioning failed: {cause}"),
            Self::HealthChecksPassed { consecutive } => {
                write!(f, "{consecutive} consecutive healthy checks")
            }
            Self::HealthCheckFailed { reason } => write!(f, "health check failed: {reason}"),
            Self::HealthCheckTimeout { checks } => {
                write!(f, "green not healthy after {checks} checks")
            }
            Self::TrafficShifted { green_weight } => write!(f, "green weight at {green_weight}"),
            Self::ValidationPassed { checks } => write!(f, "validation passed ({checks} checks)"),
            Self::ValidationFailed { reason } => write!(f, "validation failed: {reason}"),
            Self::TrafficError { error } => write!(f, "traffic weight change failed: {error}"),
            Self::CancelRequested => write!(f, "cancel requested"),
            Self::Recovered => write!(f, "recovered after restart"),
            Self::TrafficRestored => write!(f, "traffic restored to blue"),
            Self::TrafficRestoreFailed { error } => {
                write!(f, "traffic restore to blue failed: {error}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CutoverState,
    pub to: CutoverState,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub signal: Signal,
}

/// Outcome of tearing down blue after promotion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum BlueRetirement {
    #[default]
    NotStarted,
    Completed,
    Failed(String),
    /// Cancelled during the termination wait; blue left in place.
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CutoverSession {
    pub id: SessionId,
    pub blue: Stack,
    pub green: Stack,
    pub state: CutoverState,
    pub history: Vec<Transition>,
    /// The signal that sent the session into rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Signal>,
    #[serde(default)]
    pub blue_retirement: BlueRetirement,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CutoverSession {
    pub fn new(blue: Stack, green: Stack) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            blue,
            green,
            state: CutoverState::Initializing,
            history: Vec::new(),
            failure: None,
            blue_retirement: BlueRetirement::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, recording the signal. Rejects edges the state graph lacks.
    pub fn transition(&mut self, to: CutoverState, signal: Signal) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(CutoverError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let now = Utc::now();
        if to == CutoverState::RollingBack {
            self.failure = Some(signal.clone());
        }
        self.history.push(Transition {
            from: self.state,
            to,
            at: now,
            signal,
        });
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `(blue, green)` traffic weights.
    pub fn weights(&self) -> (u8, u8) {
        (self.blue.traffic_weight, self.green.traffic_weight)
    }

    /// States visited, starting with the initial one.
    pub fn path(&self) -> Vec<CutoverState> {
        let mut path = vec![self.history.first().map_or(self.state, |t| t.from)];
        path.extend(self.history.iter().map(|t| t.to));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackColor;
    use stackshift_core::DependencyGraph;
    use std::collections::BTreeMap;

    fn session() -> CutoverSession {
        let g = DependencyGraph::new();
        CutoverSession::new(
            Stack::provision(StackColor::Blue, &g, &BTreeMap::new()),
            Stack::provision(StackColor::Green, &g, &BTreeMap::new()),
        )
    }

    #[test]
    fn no_state_is_skipped() {
        use CutoverState::*;
        assert!(!Initializing.can_transition_to(HealthChecking));
        assert!(!GreenProvisioning.can_transition_to(TrafficShifting));
        assert!(!TrafficShifting.can_transition_to(Promoted));
        assert!(!RollingBack.can_transition_to(Promoted));
        assert!(!Initializing.can_transition_to(RollingBack));
        assert!(!Promoted.can_transition_to(RollingBack));
        assert!(Validating.can_transition_to(RollingBack));
    }

    #[test]
    fn transitions_are_recorded_with_signal() {
        let mut s = session();
        s.transition(CutoverState::GreenProvisioning, Signal::SessionCreated).unwrap();
        s.transition(
            CutoverState::RollingBack,
            Signal::ProvisioningFailed { cause: "quota".into() },
        )
        .unwrap();
        s.transition(CutoverState::RolledBack, Signal::TrafficRestored).unwrap();

        assert!(s.is_terminal());
        assert_eq!(s.history.len(), 3);
        assert_eq!(
            s.failure,
            Some(Signal::ProvisioningFailed { cause: "quota".into() })
        );
        assert_eq!(
            s.path(),
            vec![
                CutoverState::Initializing,
                CutoverState::GreenProvisioning,
                CutoverState::RollingBack,
                CutoverState::RolledBack
            ]
        );
    }

    #[test]
    fn invalid_transition_leaves_session_unchanged() {
        let mut s = session();
        let err = s
            .transition(CutoverState::Promoted, Signal::SessionCreated)
            .unwrap_err();
        assert!(matches!(err, CutoverError::InvalidTransition { .. }));
        assert_eq!(s.state, CutoverState::Initializing);
        assert!(s.history.is_empty());
    }

    #[test]
    fn session_round_trips_through_json() {
        let mut s = session();
        s.transition(CutoverState::GreenProvisioning, Signal::SessionCreated).unwrap();
        let text = serde_json::to_string(&s).unwrap();
        assert!(text.contains("\"signal\":\"session_created\""));
        let back: CutoverSession = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }
}
