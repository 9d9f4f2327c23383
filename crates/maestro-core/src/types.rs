use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Value object: environment id
///
/// An opaque unique token minted at environment creation and freed at
/// teardown. String-serializable; the empty string is never a valid id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(pub String);

impl EnvironmentId {
    /// Mint a fresh unique environment id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EnvironmentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CoreError::InvalidId);
        }
        Ok(Self(s.to_string()))
    }
}

/// Value object: task id, assigned by the task manager backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-observable environment state
///
/// The string renderings (`STANDBY`, `DEPLOYED`, ...) are a telemetry
/// contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentState {
    /// Initial state; no tasks configured
    Standby,
    /// Tasks deployed but not yet configured
    Deployed,
    /// All tasks configured and ready to run
    Configured,
    /// A run is in progress
    Running,
    /// A fatal failure occurred
    Error,
    /// Aggregation disagreement: tasks report conflicting states
    Mixed,
    /// The environment was cleanly torn down
    Done,
}

impl EnvironmentState {
    /// The SCREAMING name used in telemetry and event payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentState::Standby => "STANDBY",
            EnvironmentState::Deployed => "DEPLOYED",
            EnvironmentState::Configured => "CONFIGURED",
            EnvironmentState::Running => "RUNNING",
            EnvironmentState::Error => "ERROR",
            EnvironmentState::Mixed => "MIXED",
            EnvironmentState::Done => "DONE",
        }
    }

    /// Commutative, deterministic fold of two aggregated states.
    ///
    /// Equal states fold to themselves, any ERROR operand wins, and any
    /// other disagreement yields MIXED.
    pub fn merge(self, other: EnvironmentState) -> EnvironmentState {
        if self == other {
            self
        } else if self == EnvironmentState::Error || other == EnvironmentState::Error {
            EnvironmentState::Error
        } else {
            EnvironmentState::Mixed
        }
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDBY" => Ok(EnvironmentState::Standby),
            "DEPLOYED" => Ok(EnvironmentState::Deployed),
            "CONFIGURED" => Ok(EnvironmentState::Configured),
            "RUNNING" => Ok(EnvironmentState::Running),
            "ERROR" => Ok(EnvironmentState::Error),
            "MIXED" => Ok(EnvironmentState::Mixed),
            "DONE" => Ok(EnvironmentState::Done),
            other => Err(CoreError::TaskManager(format!(
                "unknown environment state: {}",
                other
            ))),
        }
    }
}

/// How the executor drives a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    /// A long-lived task driven through the full state machine
    Basic,
    /// A one-shot task launched as a transition hook
    Hook,
}
