//!
//! Maestro Core - control-plane core of the Maestro experiment orchestrator
//!
//! This crate manages the lifecycle of environments: logical groupings of
//! remote tasks running across a cluster, organized as a hierarchical
//! workflow of roles and coordinated through a task manager backend. Each
//! environment is a long-lived state machine driven through configuration,
//! activation, running, stop, reset and teardown phases, reacting to
//! asynchronous executor events while staying consistent under concurrent
//! client requests.
//!
//! The two central pieces are the [`application::manager::EnvironmentManager`]
//! (process-wide registry and sole router of backend events) and the
//! [`domain::environment::Environment`] state machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - environments, workflows, tasks, transitions, events
pub mod domain;

/// Application services - the environment manager
pub mod application;

/// Integration plugin seams
pub mod integration;

/// Core configuration
pub mod config;

/// Core types and identifiers
pub mod types;

/// Error types
pub mod error;

pub use config::CoreConfig;
pub use error::CoreError;
pub use types::{ControlMode, EnvironmentId, EnvironmentState, TaskId};

pub use application::manager::EnvironmentManager;
pub use domain::environment::Environment;
pub use domain::events::{
    DeviceEvent, DeviceEventKind, EnvironmentEvent, Event, TaskEvent, TasksReleasedEvent,
    TasksStateChangedEvent,
};
pub use domain::task::{EnvironmentMessage, TaskControl, TaskDescriptor, TaskOperation};
pub use domain::transition::{Transition, TransitionKind};
pub use domain::workflow::{HookCall, Workflow, WorkflowLoader};
pub use integration::IntegrationPlugin;
