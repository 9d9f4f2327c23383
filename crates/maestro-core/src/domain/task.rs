use crate::error::CoreError;
use crate::types::{ControlMode, EnvironmentId, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Separator between a workflow role path and a key in targeted user vars,
/// e.g. `path.to.role:someKey`
pub const TARGET_SEPARATOR: char = ':';

/// Snapshot of a task held by the task manager registry.
///
/// Tasks are owned by the task manager; the control plane refers to them by
/// id and to their workflow role by name, never by pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task id
    pub id: TaskId,
    /// Task class name
    pub class_name: String,
    /// Host the task is scheduled on
    pub hostname: String,
    /// Environment the task belongs to
    pub environment_id: EnvironmentId,
    /// Name of the workflow role that owns the task
    pub role_name: String,
    /// How the executor drives the task
    pub control_mode: ControlMode,
    /// Whether a failure of this task fails its transition
    pub critical: bool,
}

/// Operation dispatched to the task manager for a set of tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOperation {
    /// Configure the tasks for data-taking
    Configure,
    /// Start the run
    Start,
    /// Stop the run
    Stop,
    /// Reset the tasks back to standby
    Reset,
    /// Release the tasks back to the cluster
    Release,
}

/// Message sent to the task manager's bounded message channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentMessage {
    /// Operation to perform
    pub op: TaskOperation,
    /// Environment the operation applies to
    pub environment_id: EnvironmentId,
    /// Affected task set
    pub tasks: Vec<TaskId>,
    /// Per-operation parameters
    pub params: HashMap<String, String>,
}

/// Contract of the task manager backend.
///
/// The backend mediates actual task scheduling via the cluster resource
/// broker; the control plane only ever talks to it through this seam.
/// Replies arrive asynchronously on the shared event stream consumed by
/// the manager's demultiplexer.
#[async_trait]
pub trait TaskControl: Send + Sync {
    /// Enqueue a message on the bounded message channel.
    ///
    /// May block under backpressure.
    async fn send(&self, message: EnvironmentMessage) -> Result<(), CoreError>;

    /// Launch the given hook tasks immediately
    async fn trigger_hooks(&self, tasks: Vec<TaskId>) -> Result<(), CoreError>;

    /// Look up a task in the registry
    fn task(&self, id: &TaskId) -> Option<TaskDescriptor>;

    /// Mark a single task as safe to stop after its data stream ended
    fn set_safe_to_stop(&self, id: &TaskId);

    /// Whether every task of the environment is now safe to stop
    fn all_safe_to_stop(&self, environment_id: &EnvironmentId) -> bool;

    /// Force-kill the given tasks; returns the subset actually killed
    async fn kill_tasks(&self, ids: Vec<TaskId>) -> Result<Vec<TaskId>, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_message_serialization() {
        let message = EnvironmentMessage {
            op: TaskOperation::Configure,
            environment_id: EnvironmentId("env-1".to_string()),
            tasks: vec![TaskId("t1".to_string()), TaskId("t2".to_string())],
            params: HashMap::new(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["op"], "CONFIGURE");
        assert_eq!(json["tasks"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_target_separator_partitions_keys() {
        assert!("readout.flp:logLevel".contains(TARGET_SEPARATOR));
        assert!(!"logLevel".contains(TARGET_SEPARATOR));
    }
}
