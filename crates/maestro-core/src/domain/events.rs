use crate::types::{EnvironmentId, EnvironmentState, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Payload of a device lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEventKind {
    /// A basic task process terminated
    BasicTaskTerminated {
        /// Process exit code
        exit_code: i32,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
        /// Final executor-reported status string
        final_status: String,
    },
    /// The executor reached the end of the task's data stream
    EndOfStream,
}

/// A lifecycle event originating from a single remote task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Id of the originating task
    pub task_id: TaskId,
    /// What happened
    pub kind: DeviceEventKind,
    /// When the executor observed it
    pub timestamp: DateTime<Utc>,
}

/// Completion event for an in-flight task release request.
///
/// Exactly one of these is delivered per dispatched release; tasks absent
/// from `release_errors` released cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksReleasedEvent {
    /// Environment the release was requested for
    pub environment_id: EnvironmentId,
    /// Per-task release failures
    pub release_errors: HashMap<TaskId, String>,
}

/// Aggregated task acknowledgement for an in-flight transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksStateChangedEvent {
    /// Environment the transition was requested for
    pub environment_id: EnvironmentId,
    /// State the backend aggregated over the affected tasks
    pub aggregated_state: EnvironmentState,
    /// Per-task resulting states
    pub task_states: HashMap<TaskId, EnvironmentState>,
}

/// Tagged event stream inbound from the backends.
///
/// A single shared channel carries all of these; the manager's
/// demultiplexer is the only consumer.
#[derive(Debug, Clone)]
pub enum Event {
    /// A device lifecycle event from one remote task
    Device(DeviceEvent),
    /// Release completion for an environment
    TasksReleased(TasksReleasedEvent),
    /// Transition acknowledgement for an environment
    TasksStateChanged(TasksStateChangedEvent),
}

/// Per-task observability event emitted when a device event is attributed
/// to a known task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task id
    pub task_id: TaskId,
    /// Task name
    pub name: String,
    /// Task class name
    pub class_name: String,
    /// Host the task ran on
    pub hostname: String,
    /// Final reported status
    pub status: String,
}

/// Environment lifecycle event streamed to subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEvent {
    /// Environment the event belongs to
    pub environment_id: EnvironmentId,
    /// New state, if the event marks a state change
    pub state: Option<EnvironmentState>,
    /// Human-readable progress message
    pub message: Option<String>,
    /// Error rendering, if the event reports a failure
    pub error: Option<String>,
    /// Attributed per-task event, if any
    pub task: Option<TaskEvent>,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl EnvironmentEvent {
    /// A state-change event with an optional progress message
    pub fn state_change(
        environment_id: EnvironmentId,
        state: EnvironmentState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            environment_id,
            state: Some(state),
            message: Some(message.into()),
            error: None,
            task: None,
            timestamp: Utc::now(),
        }
    }

    /// A failure event
    pub fn failure(environment_id: EnvironmentId, error: impl std::fmt::Display) -> Self {
        Self {
            environment_id,
            state: None,
            message: None,
            error: Some(error.to_string()),
            task: None,
            timestamp: Utc::now(),
        }
    }

    /// A per-task attribution event
    pub fn task(environment_id: EnvironmentId, task: TaskEvent) -> Self {
        Self {
            environment_id,
            state: None,
            message: None,
            error: None,
            task: Some(task),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_event_serialization() {
        let event = EnvironmentEvent::state_change(
            EnvironmentId("env-1".to_string()),
            EnvironmentState::Done,
            "teardown complete",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "DONE");
        assert_eq!(json["message"], "teardown complete");
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_tasks_state_changed_round_trip() {
        let mut task_states = HashMap::new();
        task_states.insert(TaskId("t1".to_string()), EnvironmentState::Configured);
        task_states.insert(TaskId("t2".to_string()), EnvironmentState::Error);
        let event = TasksStateChangedEvent {
            environment_id: EnvironmentId("env-1".to_string()),
            aggregated_state: EnvironmentState::Error,
            task_states,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TasksStateChangedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_failure_event_carries_error_string() {
        let event = EnvironmentEvent::failure(
            EnvironmentId("env-2".to_string()),
            crate::CoreError::InvalidId,
        );
        assert_eq!(event.error.as_deref(), Some("invalid id: empty"));
        assert!(event.state.is_none());
    }
}
