use crate::domain::events::{
    DeviceEvent, DeviceEventKind, EnvironmentEvent, TaskEvent, TasksStateChangedEvent,
};
use crate::domain::task::{EnvironmentMessage, TaskControl};
use crate::domain::transition::Transition;
use crate::domain::workflow::{HookKind, HookSet, RoleStatus, Workflow};
use crate::error::CoreError;
use crate::types::{EnvironmentId, EnvironmentState, TaskId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// A per-environment state machine instance.
///
/// An environment owns a workflow role tree and drives it through the
/// configure/start/stop/reset lifecycle. Transitions are serialized by an
/// internal mutex; completion events are delivered by the manager's
/// demultiplexer on per-environment channels. The current state is cached
/// on a watch channel so waiters (auto environments, tests) observe
/// changes without polling.
pub struct Environment {
    id: EnvironmentId,
    workflow: RwLock<Workflow>,
    user_vars: RwLock<HashMap<String, String>>,
    state_tx: watch::Sender<EnvironmentState>,
    transition_lock: Mutex<()>,
    state_events: Mutex<mpsc::UnboundedReceiver<TasksStateChangedEvent>>,
    hook_events_tx: mpsc::UnboundedSender<DeviceEvent>,
    hook_events: Mutex<mpsc::UnboundedReceiver<DeviceEvent>>,
    subscriptions: StdMutex<Vec<mpsc::UnboundedSender<EnvironmentEvent>>>,
    task_control: Arc<dyn TaskControl>,
    hook_deadline: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Environment {
    /// Build a new environment in STANDBY with a freshly minted id.
    ///
    /// Returns the environment together with the sender half of its
    /// state-change channel; the manager registers the sender with its
    /// demultiplexer routing map. The environment's own id is always
    /// exposed to the workflow as the `environment_id` user variable.
    pub fn new(
        mut user_vars: HashMap<String, String>,
        task_control: Arc<dyn TaskControl>,
        hook_deadline: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedSender<TasksStateChangedEvent>,
    ) {
        let id = EnvironmentId::new();
        user_vars.insert("environment_id".to_string(), id.to_string());

        let (state_tx, _) = watch::channel(EnvironmentState::Standby);
        let (state_events_tx, state_events_rx) = mpsc::unbounded_channel();
        let (hook_events_tx, hook_events_rx) = mpsc::unbounded_channel();

        let env = Arc::new(Self {
            id,
            workflow: RwLock::new(Workflow::new("root")),
            user_vars: RwLock::new(user_vars),
            state_tx,
            transition_lock: Mutex::new(()),
            state_events: Mutex::new(state_events_rx),
            hook_events_tx,
            hook_events: Mutex::new(hook_events_rx),
            subscriptions: StdMutex::new(Vec::new()),
            task_control,
            hook_deadline,
            shutdown,
        });
        (env, state_events_tx)
    }

    /// The environment id
    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    /// The cached current state
    pub fn current_state(&self) -> EnvironmentState {
        *self.state_tx.borrow()
    }

    /// A watch receiver observing every state change
    pub fn state_watch(&self) -> watch::Receiver<EnvironmentState> {
        self.state_tx.subscribe()
    }

    /// Install the loaded workflow role tree
    pub async fn set_workflow(&self, workflow: Workflow) {
        *self.workflow.write().await = workflow;
    }

    /// Read a user variable
    pub async fn user_var(&self, key: &str) -> Option<String> {
        self.user_vars.read().await.get(key).cloned()
    }

    /// Set a user variable
    pub async fn set_user_var(&self, key: impl Into<String>, value: impl Into<String>) {
        self.user_vars
            .write()
            .await
            .insert(key.into(), value.into());
    }

    /// Snapshot of all user variables, e.g. as a plugin var stack
    pub async fn user_vars(&self) -> HashMap<String, String> {
        self.user_vars.read().await.clone()
    }

    /// All task ids of the workflow, hook tasks included
    pub async fn task_ids(&self) -> Vec<TaskId> {
        self.workflow.read().await.tasks()
    }

    /// Aggregated state derived from the workflow's task leaves
    pub async fn workflow_state(&self) -> EnvironmentState {
        self.workflow.read().await.aggregate_state()
    }

    /// Attach a subscription stream
    pub fn subscribe(&self, sink: mpsc::UnboundedSender<EnvironmentEvent>) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(sink);
        }
    }

    /// Send an event to every live subscription, dropping closed sinks
    pub fn send_environment_event(&self, event: EnvironmentEvent) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.retain(|sink| sink.send(event.clone()).is_ok());
        }
    }

    /// Send a per-task attribution event to the subscriptions
    pub fn send_task_event(&self, task: TaskEvent) {
        self.send_environment_event(EnvironmentEvent::task(self.id.clone(), task));
    }

    /// Drop all subscription streams
    pub fn close_stream(&self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
    }

    /// Deliver a device event for one of this environment's hook tasks.
    ///
    /// Called by the manager's demultiplexer; the in-flight transition
    /// consumes these while awaiting hook completion.
    pub fn notify_hook_event(&self, event: DeviceEvent) {
        let _ = self.hook_events_tx.send(event);
    }

    /// Whether every task of the environment finished its data stream
    pub fn is_safe_to_stop(&self) -> bool {
        self.task_control.all_safe_to_stop(&self.id)
    }

    /// Record the runtime result of a terminated task on its parent role
    pub async fn record_task_result(
        &self,
        task_id: &TaskId,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        final_status: &str,
    ) {
        let mut workflow = self.workflow.write().await;
        let Some(role) = workflow.role_for_task(task_id) else {
            warn!(environment = %self.id, task = %task_id, "device event for task with no parent role");
            return;
        };
        let mut vars = HashMap::new();
        vars.insert("task_result.exit_code".to_string(), exit_code.to_string());
        vars.insert("task_result.stdout".to_string(), stdout.to_string());
        vars.insert("task_result.stderr".to_string(), stderr.to_string());
        vars.insert(
            "task_result.final_status".to_string(),
            final_status.to_string(),
        );
        vars.insert(
            "task_result.timestamp".to_string(),
            Utc::now().timestamp().to_string(),
        );
        workflow.set_runtime_vars(role, vars);
    }

    /// Attempt a state machine transition.
    ///
    /// The transition mutex serializes attempts per environment;
    /// transitions on different environments proceed concurrently. The
    /// attempt validates the source state, fires pre-trigger hooks,
    /// dispatches the task operation, awaits the aggregated task
    /// acknowledgement routed in by the demultiplexer, fires post-trigger
    /// hooks and only then publishes the new state.
    pub async fn try_transition(&self, transition: Transition) -> Result<(), CoreError> {
        let _guard = self.transition_lock.lock().await;

        let current = self.current_state();
        if !transition.accepts(current) {
            return Err(CoreError::WrongState {
                attempted: transition.kind.name().to_string(),
                current,
            });
        }
        debug!(
            environment = %self.id,
            transition = %transition.kind,
            state = %current,
            "transition starting"
        );

        // A failed pre-hook aborts before anything was dispatched; the
        // environment keeps its current state.
        self.run_hooks(&transition.before_trigger()).await?;

        if let Some(op) = transition.op {
            let tasks = self.workflow.read().await.basic_task_ids();
            let message = EnvironmentMessage {
                op,
                environment_id: self.id.clone(),
                tasks,
                params: transition.params.clone(),
            };
            self.task_control.send(message).await?;

            let event = self.await_state_change().await?;
            self.workflow
                .write()
                .await
                .apply_task_states(&event.task_states);

            if event.aggregated_state != transition.target {
                let reached = event
                    .task_states
                    .values()
                    .filter(|state| **state == transition.target)
                    .count();
                let expected = event.task_states.len();
                let next = if event.aggregated_state == EnvironmentState::Error {
                    EnvironmentState::Error
                } else {
                    EnvironmentState::Mixed
                };
                warn!(
                    environment = %self.id,
                    transition = %transition.kind,
                    aggregated = %event.aggregated_state,
                    reached,
                    expected,
                    "transition partially failed"
                );
                self.publish_state(next, "transition partially failed");
                return Err(CoreError::PartialFailure { expected, reached });
            }
        }

        // The task set already moved; a failed post-hook must land the
        // environment on a defined non-target state.
        if let Err(error) = self.run_hooks(&transition.after_trigger()).await {
            warn!(
                environment = %self.id,
                transition = %transition.kind,
                %error,
                "post-transition hooks failed"
            );
            self.publish_state(EnvironmentState::Error, "post-transition hooks failed");
            return Err(error);
        }

        self.publish_state(transition.target, transition.kind.name());
        info!(
            environment = %self.id,
            transition = %transition.kind,
            state = %transition.target,
            "transition complete"
        );
        Ok(())
    }

    /// Hold the transition mutex for a manager-driven phase (teardown)
    pub(crate) async fn lock_transitions(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.transition_lock.lock().await
    }

    /// Publish a new state on the cache/watch and the subscription streams
    pub(crate) fn publish_state(&self, state: EnvironmentState, message: &str) {
        self.state_tx.send_replace(state);
        self.send_environment_event(EnvironmentEvent::state_change(
            self.id.clone(),
            state,
            message,
        ));
    }

    /// The teardown sets: tasks to release (everything that is not a
    /// cleanup hook) and the DESTROY/after_DESTROY hook set.
    pub(crate) async fn destroy_sets(&self) -> (Vec<TaskId>, HookSet) {
        let workflow = self.workflow.read().await;
        let mut destroy_hooks = workflow.hooks_for_trigger("DESTROY");
        destroy_hooks.extend(workflow.hooks_for_trigger("after_DESTROY"));

        let hook_task_ids = destroy_hooks.task_ids();
        let mut release = workflow.tasks();
        release.retain(|task| !hook_task_ids.contains(task));
        (release, destroy_hooks)
    }

    /// Mark all call-hook roles INACTIVE; no task activation exists for them
    pub(crate) async fn deactivate_call_hooks(&self) {
        let mut workflow = self.workflow.write().await;
        for role in workflow.call_hook_roles() {
            workflow.update_status(role, RoleStatus::Inactive);
        }
    }

    async fn run_hooks(&self, trigger: &str) -> Result<(), CoreError> {
        let hooks = self.workflow.read().await.hooks_for_trigger(trigger);
        if hooks.is_empty() {
            return Ok(());
        }
        debug!(environment = %self.id, trigger, count = hooks.len(), "firing hooks");

        hooks.call_all().await?;

        let task_hooks = hooks.filter_tasks();
        if task_hooks.is_empty() {
            return Ok(());
        }
        self.task_control
            .trigger_hooks(task_hooks.task_ids())
            .await?;
        self.await_hook_completion(task_hooks).await
    }

    /// Await termination events for every dispatched hook task.
    ///
    /// Hook tasks run remotely, so the wait carries the configured
    /// deadline. A non-zero exit code fails the hook; only critical hook
    /// failures abort the transition.
    async fn await_hook_completion(&self, hooks: HookSet) -> Result<(), CoreError> {
        let mut pending: HashMap<TaskId, (String, bool)> = hooks
            .iter()
            .filter_map(|hook| match &hook.kind {
                HookKind::Task(id) => Some((id.clone(), (hook.name.clone(), hook.critical))),
                HookKind::Call(_) => None,
            })
            .collect();
        let mut failed: Vec<String> = Vec::new();

        let mut events = self.hook_events.lock().await;
        let outcome = tokio::time::timeout(self.hook_deadline, async {
            while !pending.is_empty() {
                match events.recv().await {
                    Some(event) => {
                        let Some((name, critical)) = pending.remove(&event.task_id) else {
                            continue;
                        };
                        if let DeviceEventKind::BasicTaskTerminated { exit_code, .. } = &event.kind
                        {
                            if *exit_code != 0 {
                                if critical {
                                    failed.push(format!("{} (exit code {})", name, exit_code));
                                } else {
                                    warn!(
                                        hook = %name,
                                        exit_code,
                                        "non-critical hook task failed"
                                    );
                                }
                            }
                        }
                    }
                    None => {
                        return Err(CoreError::ChannelClosed(
                            "hook event channel closed".to_string(),
                        ))
                    }
                }
            }
            Ok(())
        })
        .await;

        match outcome {
            Err(_) => Err(CoreError::HookFailed(format!(
                "{} hook tasks missed the completion deadline",
                pending.len()
            ))),
            Ok(Err(error)) => Err(error),
            Ok(Ok(())) => {
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(CoreError::HookFailed(failed.join("; ")))
                }
            }
        }
    }

    /// Await the aggregated task acknowledgement for an in-flight
    /// transition, aborting if the manager shuts down.
    async fn await_state_change(&self) -> Result<TasksStateChangedEvent, CoreError> {
        let mut events = self.state_events.lock().await;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            event = events.recv() => event.ok_or_else(|| {
                CoreError::ChannelClosed("state change channel closed".to_string())
            }),
            _ = shutdown.changed() => Err(CoreError::ChannelClosed(
                "manager shutting down".to_string(),
            )),
        }
    }
}
