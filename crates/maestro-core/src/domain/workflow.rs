use crate::domain::task::TaskControl;
use crate::error::CoreError;
use crate::types::{EnvironmentId, EnvironmentState, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// An in-process callable fired at a transition phase
#[async_trait]
pub trait HookCall: Send + Sync {
    /// Invoke the hook
    async fn call(&self) -> Result<(), CoreError>;
}

/// Index of a role inside its workflow arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(pub usize);

/// Activation status of a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleStatus {
    /// The role has live task activity
    Active,
    /// The role has no task activation
    Inactive,
    /// Not yet determined
    Undefined,
}

/// What a role is
pub enum RoleKind {
    /// Pure grouping node aggregating its children
    Aggregator,
    /// Leaf owning a remote task
    Task {
        /// Id of the owned task
        task_id: TaskId,
        /// Task class name
        class_name: String,
        /// Whether a failure of this task fails its transition
        critical: bool,
        /// Last known task state
        state: EnvironmentState,
    },
    /// In-process callable fired at a transition phase
    CallHook {
        /// Trigger name, e.g. `before_CONFIGURE`
        trigger: String,
        /// Whether a failure aborts the transition
        critical: bool,
        /// The callable
        call: Arc<dyn HookCall>,
    },
    /// Remote task launched as a transition hook
    TaskHook {
        /// Id of the hook task
        task_id: TaskId,
        /// Trigger name
        trigger: String,
        /// Whether a failure aborts the transition
        critical: bool,
    },
}

impl fmt::Debug for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleKind::Aggregator => f.write_str("Aggregator"),
            RoleKind::Task {
                task_id,
                class_name,
                critical,
                state,
            } => f
                .debug_struct("Task")
                .field("task_id", task_id)
                .field("class_name", class_name)
                .field("critical", critical)
                .field("state", state)
                .finish(),
            RoleKind::CallHook {
                trigger, critical, ..
            } => f
                .debug_struct("CallHook")
                .field("trigger", trigger)
                .field("critical", critical)
                .finish_non_exhaustive(),
            RoleKind::TaskHook {
                task_id,
                trigger,
                critical,
            } => f
                .debug_struct("TaskHook")
                .field("task_id", task_id)
                .field("trigger", trigger)
                .field("critical", critical)
                .finish(),
        }
    }
}

/// A node in the workflow role tree
#[derive(Debug)]
pub struct RoleNode {
    name: String,
    parent: Option<RoleId>,
    children: Vec<RoleId>,
    status: RoleStatus,
    runtime_vars: HashMap<String, String>,
    kind: RoleKind,
}

impl RoleNode {
    /// Role name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Activation status
    pub fn status(&self) -> RoleStatus {
        self.status
    }

    /// Runtime variables last pushed onto this role
    pub fn runtime_vars(&self) -> &HashMap<String, String> {
        &self.runtime_vars
    }

    /// What the role is
    pub fn kind(&self) -> &RoleKind {
        &self.kind
    }

    /// The owned task id, if this role is a task or task-hook leaf
    pub fn as_task(&self) -> Option<&TaskId> {
        match &self.kind {
            RoleKind::Task { task_id, .. } | RoleKind::TaskHook { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// The callable, if this role is a call-hook
    pub fn as_call_hook(&self) -> Option<&Arc<dyn HookCall>> {
        match &self.kind {
            RoleKind::CallHook { call, .. } => Some(call),
            _ => None,
        }
    }
}

/// How a hook is executed
#[derive(Clone)]
pub enum HookKind {
    /// In-process callable
    Call(Arc<dyn HookCall>),
    /// Remote task launched by the task manager
    Task(TaskId),
}

/// One hook selected from a workflow
#[derive(Clone)]
pub struct Hook {
    /// Role the hook lives on
    pub role: RoleId,
    /// Role name, used for failure reporting
    pub name: String,
    /// Trigger the hook fires on
    pub trigger: String,
    /// Whether a failure aborts the transition
    pub critical: bool,
    /// How the hook executes
    pub kind: HookKind,
}

/// A set of hooks filtered out of a workflow, preserving tree order
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Hook>,
}

impl HookSet {
    /// True if the set holds no hooks
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Number of hooks in the set
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Iterate the hooks in tree order
    pub fn iter(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter()
    }

    /// Append all hooks of another set
    pub fn extend(&mut self, other: HookSet) {
        self.hooks.extend(other.hooks);
    }

    /// The call-kind subset
    pub fn filter_calls(&self) -> HookSet {
        HookSet {
            hooks: self
                .hooks
                .iter()
                .filter(|h| matches!(h.kind, HookKind::Call(_)))
                .cloned()
                .collect(),
        }
    }

    /// The task-kind subset
    pub fn filter_tasks(&self) -> HookSet {
        HookSet {
            hooks: self
                .hooks
                .iter()
                .filter(|h| matches!(h.kind, HookKind::Task(_)))
                .cloned()
                .collect(),
        }
    }

    /// Task ids of the task-kind hooks, in tree order
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.hooks
            .iter()
            .filter_map(|h| match &h.kind {
                HookKind::Task(id) => Some(id.clone()),
                HookKind::Call(_) => None,
            })
            .collect()
    }

    /// Invoke every call-kind hook in tree order.
    ///
    /// Failures of critical hooks abort with [`CoreError::HookFailed`]
    /// after all calls ran; non-critical failures are logged only.
    pub async fn call_all(&self) -> Result<(), CoreError> {
        let mut failed = Vec::new();
        for hook in &self.hooks {
            let call = match &hook.kind {
                HookKind::Call(call) => call,
                HookKind::Task(_) => continue,
            };
            if let Err(error) = call.call().await {
                if hook.critical {
                    failed.push(format!("{}: {}", hook.name, error));
                } else {
                    warn!(hook = %hook.name, %error, "non-critical hook failed");
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CoreError::HookFailed(failed.join("; ")))
        }
    }
}

/// The workflow role tree of an environment.
///
/// Nodes live in an arena and refer to each other by [`RoleId`]; the
/// topology is immutable after loading, only role status, runtime vars and
/// task states mutate at runtime.
#[derive(Debug)]
pub struct Workflow {
    nodes: Vec<RoleNode>,
    root: RoleId,
}

impl Workflow {
    /// Create a workflow holding a single aggregator root
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = RoleNode {
            name: root_name.into(),
            parent: None,
            children: Vec::new(),
            status: RoleStatus::Undefined,
            runtime_vars: HashMap::new(),
            kind: RoleKind::Aggregator,
        };
        Self {
            nodes: vec![root],
            root: RoleId(0),
        }
    }

    /// The root role
    pub fn root(&self) -> RoleId {
        self.root
    }

    /// Borrow a role node
    pub fn node(&self, id: RoleId) -> &RoleNode {
        &self.nodes[id.0]
    }

    /// The parent of a role, if it has one
    pub fn parent(&self, id: RoleId) -> Option<RoleId> {
        self.nodes[id.0].parent
    }

    fn add_node(&mut self, parent: RoleId, name: String, kind: RoleKind) -> RoleId {
        let id = RoleId(self.nodes.len());
        self.nodes.push(RoleNode {
            name,
            parent: Some(parent),
            children: Vec::new(),
            status: RoleStatus::Undefined,
            runtime_vars: HashMap::new(),
            kind,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Add an aggregator role under `parent`
    pub fn add_aggregator(&mut self, parent: RoleId, name: impl Into<String>) -> RoleId {
        self.add_node(parent, name.into(), RoleKind::Aggregator)
    }

    /// Add a task leaf under `parent`
    pub fn add_task(
        &mut self,
        parent: RoleId,
        name: impl Into<String>,
        task_id: TaskId,
        class_name: impl Into<String>,
        critical: bool,
    ) -> RoleId {
        self.add_node(
            parent,
            name.into(),
            RoleKind::Task {
                task_id,
                class_name: class_name.into(),
                critical,
                state: EnvironmentState::Standby,
            },
        )
    }

    /// Add a call-hook role under `parent`
    pub fn add_call_hook(
        &mut self,
        parent: RoleId,
        name: impl Into<String>,
        trigger: impl Into<String>,
        critical: bool,
        call: Arc<dyn HookCall>,
    ) -> RoleId {
        self.add_node(
            parent,
            name.into(),
            RoleKind::CallHook {
                trigger: trigger.into(),
                critical,
                call,
            },
        )
    }

    /// Add a task-hook role under `parent`
    pub fn add_task_hook(
        &mut self,
        parent: RoleId,
        name: impl Into<String>,
        trigger: impl Into<String>,
        critical: bool,
        task_id: TaskId,
    ) -> RoleId {
        self.add_node(
            parent,
            name.into(),
            RoleKind::TaskHook {
                task_id,
                trigger: trigger.into(),
                critical,
            },
        )
    }

    /// Preorder walk of the tree, children in insertion order
    fn walk(&self) -> Vec<RoleId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.nodes[id.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// All task ids under the root in deterministic tree order, including
    /// hook tasks
    pub fn tasks(&self) -> Vec<TaskId> {
        self.walk()
            .into_iter()
            .filter_map(|id| self.nodes[id.0].as_task().cloned())
            .collect()
    }

    /// Task ids of basic (non-hook) task leaves, in tree order
    pub fn basic_task_ids(&self) -> Vec<TaskId> {
        self.walk()
            .into_iter()
            .filter_map(|id| match &self.nodes[id.0].kind {
                RoleKind::Task { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Hooks filtered by trigger name; the empty trigger selects all hooks
    pub fn hooks_for_trigger(&self, trigger: &str) -> HookSet {
        let mut hooks = Vec::new();
        for id in self.walk() {
            let node = &self.nodes[id.0];
            let (hook_trigger, critical, kind) = match &node.kind {
                RoleKind::CallHook {
                    trigger: t,
                    critical,
                    call,
                } => (t, *critical, HookKind::Call(call.clone())),
                RoleKind::TaskHook {
                    task_id,
                    trigger: t,
                    critical,
                } => (t, *critical, HookKind::Task(task_id.clone())),
                _ => continue,
            };
            if trigger.is_empty() || hook_trigger == trigger {
                hooks.push(Hook {
                    role: id,
                    name: node.name.clone(),
                    trigger: hook_trigger.clone(),
                    critical,
                    kind,
                });
            }
        }
        HookSet { hooks }
    }

    /// Role ids of all call-hook roles
    pub fn call_hook_roles(&self) -> Vec<RoleId> {
        self.walk()
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, RoleKind::CallHook { .. }))
            .collect()
    }

    /// Aggregated state: commutative fold over basic task leaf states.
    ///
    /// An empty workflow aggregates to STANDBY; disagreement yields MIXED.
    pub fn aggregate_state(&self) -> EnvironmentState {
        let mut aggregated = None;
        for node in &self.nodes {
            if let RoleKind::Task { state, .. } = &node.kind {
                aggregated = Some(match aggregated {
                    None => *state,
                    Some(acc) => EnvironmentState::merge(acc, *state),
                });
            }
        }
        aggregated.unwrap_or(EnvironmentState::Standby)
    }

    /// Apply per-task states reported by the backend to the task leaves
    pub fn apply_task_states(&mut self, states: &HashMap<TaskId, EnvironmentState>) {
        for node in &mut self.nodes {
            if let RoleKind::Task { task_id, state, .. } = &mut node.kind {
                if let Some(new_state) = states.get(task_id) {
                    *state = *new_state;
                }
            }
        }
    }

    /// The role owning the given task, if any
    pub fn role_for_task(&self, task_id: &TaskId) -> Option<RoleId> {
        self.walk()
            .into_iter()
            .find(|id| self.nodes[id.0].as_task() == Some(task_id))
    }

    /// Merge runtime variables into a role
    pub fn set_runtime_vars(&mut self, role: RoleId, vars: HashMap<String, String>) {
        self.nodes[role.0].runtime_vars.extend(vars);
    }

    /// Update the activation status of a role
    pub fn update_status(&mut self, role: RoleId, status: RoleStatus) {
        self.nodes[role.0].status = status;
    }
}

/// Materializes a role tree from a workflow template path.
///
/// The loader is an external collaborator; paths containing `://` are
/// reserved for remote loading and rejected before the loader is
/// consulted.
#[async_trait]
pub trait WorkflowLoader: Send + Sync {
    /// Load the workflow rooted at `path`, binding tasks through
    /// `task_control` and injecting the targeted user variables.
    async fn load(
        &self,
        path: &str,
        environment_id: &EnvironmentId,
        task_control: Arc<dyn TaskControl>,
        user_vars: &HashMap<String, String>,
    ) -> Result<Workflow, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHook {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl HookCall for CountingHook {
        async fn call(&self) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CoreError::HookFailed("scripted failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn task_id(s: &str) -> TaskId {
        TaskId(s.to_string())
    }

    fn sample_workflow() -> Workflow {
        let mut wf = Workflow::new("readout-dataflow");
        let root = wf.root();
        let flp = wf.add_aggregator(root, "flp");
        wf.add_task(flp, "readout-1", task_id("t1"), "readout", true);
        wf.add_task(flp, "readout-2", task_id("t2"), "readout", true);
        let epn = wf.add_aggregator(root, "epn");
        wf.add_task(epn, "processing", task_id("t3"), "processing", false);
        wf
    }

    #[test]
    fn test_tasks_in_deterministic_tree_order() {
        let wf = sample_workflow();
        assert_eq!(
            wf.tasks(),
            vec![task_id("t1"), task_id("t2"), task_id("t3")]
        );
        assert_eq!(wf.tasks(), wf.tasks());
    }

    #[test]
    fn test_tasks_include_hook_tasks_but_basic_set_does_not() {
        let mut wf = sample_workflow();
        let root = wf.root();
        wf.add_task_hook(root, "cleanup", "DESTROY", false, task_id("h1"));
        assert!(wf.tasks().contains(&task_id("h1")));
        assert!(!wf.basic_task_ids().contains(&task_id("h1")));
    }

    #[test]
    fn test_parent_access() {
        let mut wf = Workflow::new("root");
        let root = wf.root();
        let group = wf.add_aggregator(root, "group");
        let leaf = wf.add_task(group, "leaf", task_id("t"), "class", true);
        assert_eq!(wf.parent(leaf), Some(group));
        assert_eq!(wf.parent(group), Some(root));
        assert_eq!(wf.parent(root), None);
    }

    #[test]
    fn test_hooks_for_trigger_filters_and_empty_selects_all() {
        let mut wf = sample_workflow();
        let root = wf.root();
        wf.add_call_hook(root, "partition-init", "before_CONFIGURE", true, CountingHook::new(false));
        wf.add_task_hook(root, "cleanup", "DESTROY", false, task_id("h1"));

        assert_eq!(wf.hooks_for_trigger("before_CONFIGURE").len(), 1);
        assert_eq!(wf.hooks_for_trigger("DESTROY").len(), 1);
        assert_eq!(wf.hooks_for_trigger("after_START").len(), 0);
        assert_eq!(wf.hooks_for_trigger("").len(), 2);

        let destroy = wf.hooks_for_trigger("DESTROY");
        assert_eq!(destroy.filter_tasks().task_ids(), vec![task_id("h1")]);
        assert!(destroy.filter_calls().is_empty());
    }

    #[tokio::test]
    async fn test_call_all_critical_failure_aborts() {
        let mut wf = Workflow::new("root");
        let root = wf.root();
        let ok = CountingHook::new(false);
        let bad = CountingHook::new(true);
        wf.add_call_hook(root, "ok-hook", "before_START", true, ok.clone());
        wf.add_call_hook(root, "bad-hook", "before_START", true, bad.clone());

        let result = wf.hooks_for_trigger("before_START").call_all().await;
        assert!(matches!(result, Err(CoreError::HookFailed(_))));
        // All hooks still ran
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_all_non_critical_failure_is_swallowed() {
        let mut wf = Workflow::new("root");
        let root = wf.root();
        let bad = CountingHook::new(true);
        wf.add_call_hook(root, "best-effort", "after_STOP", false, bad.clone());

        assert!(wf.hooks_for_trigger("after_STOP").call_all().await.is_ok());
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_aggregate_state() {
        let mut wf = sample_workflow();
        // All leaves start in STANDBY
        assert_eq!(wf.aggregate_state(), EnvironmentState::Standby);

        let mut states = HashMap::new();
        states.insert(task_id("t1"), EnvironmentState::Configured);
        states.insert(task_id("t2"), EnvironmentState::Configured);
        states.insert(task_id("t3"), EnvironmentState::Configured);
        wf.apply_task_states(&states);
        assert_eq!(wf.aggregate_state(), EnvironmentState::Configured);

        // Disagreement yields MIXED
        states.insert(task_id("t3"), EnvironmentState::Running);
        wf.apply_task_states(&states);
        assert_eq!(wf.aggregate_state(), EnvironmentState::Mixed);

        // Any ERROR wins
        states.insert(task_id("t2"), EnvironmentState::Error);
        wf.apply_task_states(&states);
        assert_eq!(wf.aggregate_state(), EnvironmentState::Error);
    }

    #[test]
    fn test_empty_workflow_aggregates_to_standby() {
        let wf = Workflow::new("empty");
        assert_eq!(wf.aggregate_state(), EnvironmentState::Standby);
    }

    #[test]
    fn test_runtime_vars_and_status() {
        let mut wf = sample_workflow();
        let role = wf.role_for_task(&task_id("t1")).unwrap();
        let mut vars = HashMap::new();
        vars.insert("task_result.exit_code".to_string(), "0".to_string());
        wf.set_runtime_vars(role, vars);
        assert_eq!(
            wf.node(role).runtime_vars().get("task_result.exit_code"),
            Some(&"0".to_string())
        );

        assert_eq!(wf.node(role).status(), RoleStatus::Undefined);
        wf.update_status(role, RoleStatus::Inactive);
        assert_eq!(wf.node(role).status(), RoleStatus::Inactive);
    }

    #[test]
    fn test_capability_queries() {
        let mut wf = Workflow::new("root");
        let root = wf.root();
        let task = wf.add_task(root, "leaf", task_id("t"), "class", true);
        let hook = wf.add_call_hook(root, "hook", "DESTROY", false, CountingHook::new(false));

        assert_eq!(wf.node(task).as_task(), Some(&task_id("t")));
        assert!(wf.node(task).as_call_hook().is_none());
        assert!(wf.node(hook).as_call_hook().is_some());
        assert!(wf.node(root).as_task().is_none());
    }
}
