use crate::domain::task::TaskOperation;
use crate::types::EnvironmentState;
use std::collections::HashMap;
use std::fmt;

/// The edges of the environment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// Deploy and configure the workflow's tasks
    Configure,
    /// Start a run
    Start,
    /// Stop the run
    Stop,
    /// Reset back to standby
    Reset,
    /// Recover a failed environment back to deployed
    Recover,
    /// Force the environment into the error state
    GoError,
    /// Tear the environment down
    Destroy,
}

impl TransitionKind {
    /// The SCREAMING name used in logs and hook trigger names
    pub fn name(&self) -> &'static str {
        match self {
            TransitionKind::Configure => "CONFIGURE",
            TransitionKind::Start => "START",
            TransitionKind::Stop => "STOP",
            TransitionKind::Reset => "RESET",
            TransitionKind::Recover => "RECOVER",
            TransitionKind::GoError => "GO_ERROR",
            TransitionKind::Destroy => "DESTROY",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const ANY_STATE: &[EnvironmentState] = &[
    EnvironmentState::Standby,
    EnvironmentState::Deployed,
    EnvironmentState::Configured,
    EnvironmentState::Running,
    EnvironmentState::Error,
    EnvironmentState::Mixed,
    EnvironmentState::Done,
];

/// Descriptor of one environment state machine edge.
///
/// A descriptor names the source states it accepts, the target state, the
/// task operation to dispatch (if any) and, via [`Transition::before_trigger`]
/// and [`Transition::after_trigger`], the hook triggers fired around it.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Which edge this is
    pub kind: TransitionKind,
    /// Source states the transition accepts
    pub sources: &'static [EnvironmentState],
    /// State the environment lands on when the transition succeeds
    pub target: EnvironmentState,
    /// Task operation dispatched to the task manager, if any
    pub op: Option<TaskOperation>,
    /// Per-operation parameters forwarded with the message
    pub params: HashMap<String, String>,
}

impl Transition {
    /// STANDBY/DEPLOYED → CONFIGURED, dispatching Configure
    pub fn configure() -> Self {
        Self {
            kind: TransitionKind::Configure,
            sources: &[EnvironmentState::Standby, EnvironmentState::Deployed],
            target: EnvironmentState::Configured,
            op: Some(TaskOperation::Configure),
            params: HashMap::new(),
        }
    }

    /// CONFIGURED → RUNNING, dispatching Start
    pub fn start() -> Self {
        Self {
            kind: TransitionKind::Start,
            sources: &[EnvironmentState::Configured],
            target: EnvironmentState::Running,
            op: Some(TaskOperation::Start),
            params: HashMap::new(),
        }
    }

    /// RUNNING → CONFIGURED, dispatching Stop
    pub fn stop() -> Self {
        Self {
            kind: TransitionKind::Stop,
            sources: &[EnvironmentState::Running],
            target: EnvironmentState::Configured,
            op: Some(TaskOperation::Stop),
            params: HashMap::new(),
        }
    }

    /// CONFIGURED → STANDBY, dispatching Reset
    pub fn reset() -> Self {
        Self {
            kind: TransitionKind::Reset,
            sources: &[EnvironmentState::Configured],
            target: EnvironmentState::Standby,
            op: Some(TaskOperation::Reset),
            params: HashMap::new(),
        }
    }

    /// ERROR → DEPLOYED; tasks stay deployed but must be reconfigured
    pub fn recover() -> Self {
        Self {
            kind: TransitionKind::Recover,
            sources: &[EnvironmentState::Error],
            target: EnvironmentState::Deployed,
            op: None,
            params: HashMap::new(),
        }
    }

    /// any → ERROR, no task operation
    pub fn go_error() -> Self {
        Self {
            kind: TransitionKind::GoError,
            sources: ANY_STATE,
            target: EnvironmentState::Error,
            op: None,
            params: HashMap::new(),
        }
    }

    /// any → DONE, dispatching Release; driven by the manager's teardown
    pub fn destroy() -> Self {
        Self {
            kind: TransitionKind::Destroy,
            sources: ANY_STATE,
            target: EnvironmentState::Done,
            op: Some(TaskOperation::Release),
            params: HashMap::new(),
        }
    }

    /// Whether the transition accepts the given source state
    pub fn accepts(&self, state: EnvironmentState) -> bool {
        self.sources.contains(&state)
    }

    /// Hook trigger fired before the task operation, e.g. `before_CONFIGURE`
    pub fn before_trigger(&self) -> String {
        format!("before_{}", self.kind.name())
    }

    /// Hook trigger fired after the task operation, e.g. `after_CONFIGURE`
    pub fn after_trigger(&self) -> String {
        format!("after_{}", self.kind.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_table() {
        use EnvironmentState::*;

        let configure = Transition::configure();
        assert!(configure.accepts(Standby));
        assert!(configure.accepts(Deployed));
        assert!(!configure.accepts(Running));
        assert_eq!(configure.target, Configured);
        assert_eq!(configure.op, Some(TaskOperation::Configure));

        let start = Transition::start();
        assert!(start.accepts(Configured));
        assert!(!start.accepts(Standby));
        assert_eq!(start.target, Running);

        let stop = Transition::stop();
        assert!(stop.accepts(Running));
        assert_eq!(stop.target, Configured);

        let reset = Transition::reset();
        assert!(reset.accepts(Configured));
        assert_eq!(reset.target, Standby);

        let recover = Transition::recover();
        assert!(recover.accepts(Error));
        assert!(!recover.accepts(Mixed));
        assert_eq!(recover.target, Deployed);
        assert_eq!(recover.op, None);
    }

    #[test]
    fn test_go_error_and_destroy_accept_any_state() {
        use EnvironmentState::*;
        for state in [Standby, Deployed, Configured, Running, Error, Mixed, Done] {
            assert!(Transition::go_error().accepts(state));
            assert!(Transition::destroy().accepts(state));
        }
        assert_eq!(Transition::go_error().op, None);
        assert_eq!(Transition::destroy().op, Some(TaskOperation::Release));
    }

    #[test]
    fn test_trigger_names() {
        let t = Transition::configure();
        assert_eq!(t.before_trigger(), "before_CONFIGURE");
        assert_eq!(t.after_trigger(), "after_CONFIGURE");
        assert_eq!(Transition::destroy().kind.name(), "DESTROY");
    }
}
