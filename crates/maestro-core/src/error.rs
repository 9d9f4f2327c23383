use crate::types::{EnvironmentId, EnvironmentState};
use thiserror::Error;

/// Core error type for the Maestro control plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The workflow loader failed; creation aborts
    #[error("cannot load workflow template: {0}")]
    WorkflowLoadFailed(String),

    /// A transition was attempted from an ineligible source state
    #[error("transition {attempted} not allowed from state {current}")]
    WrongState {
        /// Name of the attempted transition
        attempted: String,
        /// State the environment was in
        current: EnvironmentState,
    },

    /// A required pre/post hook reported failure; the transition aborts
    #[error("hook failed: {0}")]
    HookFailed(String),

    /// Some tasks did not reach the target state; the environment moves to MIXED
    #[error("{reached} of {expected} tasks reached the target state")]
    PartialFailure {
        /// Number of tasks expected to reach the target
        expected: usize,
        /// Number of tasks that actually reached it
        reached: usize,
    },

    /// Tasks failed to release during teardown; cleanup continued regardless
    #[error("{0} tasks failed to release")]
    ReleaseFailed(usize),

    /// Lookup by an id no environment is registered under
    #[error("no environment with id {0}")]
    NoSuchEnvironment(EnvironmentId),

    /// An empty environment id
    #[error("invalid id: empty")]
    InvalidId,

    /// A feature reserved for future use, e.g. remote workflow loading
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A routing channel closed mid-await (manager shutdown or teardown)
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The task manager backend rejected a message or call
    #[error("task manager error: {0}")]
    TaskManager(String),
}
