/// Environment state machine
pub mod environment;

/// Backend and observability event types
pub mod events;

/// Task descriptors and the task manager contract
pub mod task;

/// Transition descriptors
pub mod transition;

/// Workflow role tree
pub mod workflow;
