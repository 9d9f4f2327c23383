use crate::config::CoreConfig;
use crate::domain::environment::Environment;
use crate::domain::events::{
    DeviceEvent, DeviceEventKind, EnvironmentEvent, Event, TaskEvent, TasksReleasedEvent,
    TasksStateChangedEvent,
};
use crate::domain::task::{
    EnvironmentMessage, TaskControl, TaskDescriptor, TaskOperation, TARGET_SEPARATOR,
};
use crate::domain::transition::Transition;
use crate::domain::workflow::WorkflowLoader;
use crate::error::CoreError;
use crate::types::{ControlMode, EnvironmentId, EnvironmentState, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Registry state guarded by the manager lock.
///
/// The lock is never held across an await on a routing channel; otherwise
/// the demultiplexer could not deliver the completion event being awaited.
#[derive(Default)]
struct Registry {
    environments: HashMap<EnvironmentId, Arc<Environment>>,
    pending_teardowns: HashMap<EnvironmentId, oneshot::Sender<TasksReleasedEvent>>,
    pending_state_changes: HashMap<EnvironmentId, mpsc::UnboundedSender<TasksStateChangedEvent>>,
}

/// Process-wide owner of environments and sole router of backend events.
///
/// The manager is a constructed value; components that need it receive a
/// reference explicitly. At construction it spawns the demultiplexer: a
/// single long-lived task consuming the shared backend event stream and
/// routing completion events into per-environment channels. The
/// demultiplexer is the only reader of the inbound stream and the only
/// writer to the routing channels.
pub struct EnvironmentManager {
    registry: RwLock<Registry>,
    task_control: Arc<dyn TaskControl>,
    loader: Arc<dyn WorkflowLoader>,
    config: CoreConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl EnvironmentManager {
    /// Build a manager and spawn its demultiplexer over `events`.
    pub fn new(
        task_control: Arc<dyn TaskControl>,
        loader: Arc<dyn WorkflowLoader>,
        events: mpsc::UnboundedReceiver<Event>,
        config: CoreConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            task_control,
            loader,
            config,
            shutdown_tx,
        });

        let demux = manager.clone();
        tokio::spawn(async move {
            demux.run_demux(events, shutdown_rx).await;
        });
        manager
    }

    /// Signal shutdown; in-flight transition and teardown awaits abort.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Ids of all registered environments
    pub async fn ids(&self) -> Vec<EnvironmentId> {
        self.registry.read().await.environments.keys().cloned().collect()
    }

    /// Look up an environment by id
    pub async fn environment(&self, id: &EnvironmentId) -> Result<Arc<Environment>, CoreError> {
        if id.0.is_empty() {
            return Err(CoreError::InvalidId);
        }
        self.registry
            .read()
            .await
            .environments
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NoSuchEnvironment(id.clone()))
    }

    /// Synchronously build, register and configure a new environment.
    ///
    /// On success the environment is registered and CONFIGURED. On any
    /// failure the partially-built environment and its tasks are torn down
    /// before returning, and the original cause is preserved.
    pub async fn create(
        &self,
        workflow_path: &str,
        user_vars: HashMap<String, String>,
    ) -> Result<EnvironmentId, CoreError> {
        let env = self
            .prepare_environment(workflow_path, user_vars, None)
            .await?;

        match env.try_transition(Transition::configure()).await {
            Ok(()) => {
                info!(environment = %env.id(), "environment created and configured");
                Ok(env.id().clone())
            }
            Err(error) => {
                self.cleanup_failed_deployment(&env, &error).await;
                Err(error)
            }
        }
    }

    /// Asynchronous variant of [`EnvironmentManager::create`] that also
    /// drives the run: configure, start, await run completion, then reset
    /// and tear down. Progress is streamed to `subscription`.
    ///
    /// The loop terminates when the environment reaches ERROR or MIXED, or
    /// when its state watch closes.
    pub async fn create_auto(
        &self,
        workflow_path: &str,
        user_vars: HashMap<String, String>,
        subscription: mpsc::UnboundedSender<EnvironmentEvent>,
    ) {
        let env = match self
            .prepare_environment(workflow_path, user_vars, Some(subscription))
            .await
        {
            Ok(env) => env,
            Err(_) => return, // reported on the subscription stream
        };

        if let Err(error) = env.try_transition(Transition::configure()).await {
            env.send_environment_event(EnvironmentEvent::failure(env.id().clone(), &error));
            self.cleanup_failed_deployment(&env, &error).await;
            env.close_stream();
            return;
        }

        // Subscribe before starting so no state change can be missed.
        let mut state_watch = env.state_watch();

        if let Err(error) = env.try_transition(Transition::start()).await {
            env.send_environment_event(EnvironmentEvent::failure(env.id().clone(), &error));
            env.close_stream();
            return;
        }

        loop {
            if state_watch.changed().await.is_err() {
                break;
            }
            let state = *state_watch.borrow_and_update();
            match state {
                EnvironmentState::Configured => {
                    // The run finished; reset, tear down, kill leftovers.
                    if let Err(error) = env.try_transition(Transition::reset()).await {
                        env.send_environment_event(EnvironmentEvent::failure(
                            env.id().clone(),
                            &error,
                        ));
                        break;
                    }
                    let task_ids = env.task_ids().await;
                    if let Err(error) = self.teardown(env.id(), false).await {
                        env.send_environment_event(EnvironmentEvent::failure(
                            env.id().clone(),
                            &error,
                        ));
                        break;
                    }
                    if let Err(error) = self.task_control.kill_tasks(task_ids).await {
                        warn!(environment = %env.id(), %error, "task teardown error");
                    }
                    break;
                }
                EnvironmentState::Error | EnvironmentState::Mixed | EnvironmentState::Done => {
                    break
                }
                _ => continue,
            }
        }
        env.close_stream();
    }

    /// Release all tasks, fire DESTROY hooks, release the hook tasks too,
    /// and unregister the environment.
    ///
    /// A non-forced teardown is refused while the environment is active
    /// (DEPLOYED, CONFIGURED or RUNNING). Release failures accumulate into
    /// [`CoreError::ReleaseFailed`] but cleanup always continues and the
    /// environment is always removed.
    pub async fn teardown(&self, id: &EnvironmentId, force: bool) -> Result<(), CoreError> {
        let env = self.environment(id).await?;

        // Serialize against transitions, then re-check registration: a
        // concurrent teardown may have won the race while we waited.
        let _guard = env.lock_transitions().await;
        if !self.registry.read().await.environments.contains_key(id) {
            return Err(CoreError::NoSuchEnvironment(id.clone()));
        }

        let state = env.current_state();
        if !force
            && matches!(
                state,
                EnvironmentState::Deployed
                    | EnvironmentState::Configured
                    | EnvironmentState::Running
            )
        {
            return Err(CoreError::WrongState {
                attempted: Transition::destroy().kind.name().to_string(),
                current: state,
            });
        }
        info!(environment = %id, state = %state, force, "environment teardown starting");

        // Cleanup hooks are subtracted from the first release batch and
        // released separately after they have fired.
        let (release_set, destroy_hooks) = env.destroy_sets().await;

        // No further transitions will run; drop the state-change route.
        self.registry.write().await.pending_state_changes.remove(id);

        // Call roles never get a task activation, so mark them INACTIVE.
        env.deactivate_call_hooks().await;

        // A release that cannot even be dispatched or awaited still must
        // not abort teardown; the whole batch counts as failed and the
        // environment is removed regardless.
        let mut failed_releases = 0usize;
        let release_count = release_set.len();
        match self.release_and_await(id, release_set).await {
            Ok(count) => failed_releases += count,
            Err(error) => {
                warn!(environment = %id, %error, "task release did not complete");
                failed_releases += release_count;
            }
        }

        // Hook failures during teardown are logged, never returned.
        if let Err(error) = destroy_hooks.filter_calls().call_all().await {
            warn!(environment = %id, %error, "environment destroy hooks failed");
        }
        let hook_tasks = destroy_hooks.task_ids();
        if !hook_tasks.is_empty() {
            if let Err(error) = self.task_control.trigger_hooks(hook_tasks.clone()).await {
                warn!(environment = %id, %error, "environment post-destroy hooks failed");
            }
            let hook_count = hook_tasks.len();
            match self.release_and_await(id, hook_tasks).await {
                Ok(count) => failed_releases += count,
                Err(error) => {
                    warn!(environment = %id, %error, "hook task release did not complete");
                    failed_releases += hook_count;
                }
            }
        }

        env.publish_state(EnvironmentState::Done, "teardown complete");
        {
            let mut registry = self.registry.write().await;
            registry.environments.remove(id);
            registry.pending_teardowns.remove(id);
        }
        env.close_stream();
        info!(environment = %id, failed_releases, "environment teardown complete");

        if failed_releases > 0 {
            Err(CoreError::ReleaseFailed(failed_releases))
        } else {
            Ok(())
        }
    }

    /// Build an environment, load its workflow and register it together
    /// with its state-change route.
    async fn prepare_environment(
        &self,
        workflow_path: &str,
        user_vars: HashMap<String, String>,
        subscription: Option<mpsc::UnboundedSender<EnvironmentEvent>>,
    ) -> Result<Arc<Environment>, CoreError> {
        let (env_vars, workflow_vars) = partition_user_vars(user_vars);

        let (env, state_sender) = Environment::new(
            env_vars,
            self.task_control.clone(),
            self.config.hook_deadline(),
            self.shutdown_tx.subscribe(),
        );
        if let Some(sink) = subscription {
            env.subscribe(sink);
        }

        let workflow = match self
            .load_workflow(workflow_path, env.id(), &workflow_vars)
            .await
        {
            Ok(workflow) => workflow,
            Err(error) => {
                env.send_environment_event(EnvironmentEvent::failure(env.id().clone(), &error));
                env.close_stream();
                return Err(error);
            }
        };
        env.set_workflow(workflow).await;

        let mut registry = self.registry.write().await;
        registry.environments.insert(env.id().clone(), env.clone());
        registry
            .pending_state_changes
            .insert(env.id().clone(), state_sender);
        drop(registry);

        Ok(env)
    }

    async fn load_workflow(
        &self,
        workflow_path: &str,
        environment_id: &EnvironmentId,
        workflow_vars: &HashMap<String, String>,
    ) -> Result<crate::domain::workflow::Workflow, CoreError> {
        if workflow_path.contains("://") {
            return Err(CoreError::NotImplemented(
                "remote workflow loading".to_string(),
            ));
        }
        self.loader
            .load(
                workflow_path,
                environment_id,
                self.task_control.clone(),
                workflow_vars,
            )
            .await
            .map_err(|error| match error {
                e @ CoreError::WorkflowLoadFailed(_) => e,
                other => CoreError::WorkflowLoadFailed(other.to_string()),
            })
    }

    /// Deployment/configuration failure path: force-teardown the
    /// environment and kill whatever tasks it acquired. The caller keeps
    /// the original error.
    async fn cleanup_failed_deployment(&self, env: &Arc<Environment>, cause: &CoreError) {
        let state = env.current_state();
        warn!(
            environment = %env.id(),
            state = %state,
            error = %cause,
            "environment deployment and configuration failed, cleanup in progress"
        );

        let task_ids = env.task_ids().await;
        if let Err(teardown_error) = self.teardown(env.id(), true).await {
            warn!(environment = %env.id(), error = %teardown_error, "environment cleanup teardown failed");
        }
        match self.task_control.kill_tasks(task_ids).await {
            Ok(killed) => warn!(
                environment = %env.id(),
                killed_count = killed.len(),
                last_state = %state,
                "environment deployment failed, tasks were cleaned up"
            ),
            Err(release_error) => warn!(error = %release_error, "task teardown error"),
        }
    }

    /// Dispatch a release for `tasks`, await its completion event on a
    /// fresh teardown route, and return the number of failed releases.
    ///
    /// The oneshot exists only while the release is in flight; it receives
    /// exactly one event and consumption closes it.
    async fn release_and_await(
        &self,
        id: &EnvironmentId,
        tasks: Vec<TaskId>,
    ) -> Result<usize, CoreError> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let receiver = {
            let mut registry = self.registry.write().await;
            let (sender, receiver) = oneshot::channel();
            registry.pending_teardowns.insert(id.clone(), sender);
            receiver
        };

        let message = EnvironmentMessage {
            op: TaskOperation::Release,
            environment_id: id.clone(),
            tasks,
            params: HashMap::new(),
        };
        if let Err(error) = self.task_control.send(message).await {
            self.registry.write().await.pending_teardowns.remove(id);
            return Err(error);
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let event = tokio::select! {
            received = receiver => received.map_err(|_| {
                CoreError::ChannelClosed("teardown channel closed".to_string())
            })?,
            _ = shutdown.changed() => {
                self.registry.write().await.pending_teardowns.remove(id);
                return Err(CoreError::ChannelClosed("manager shutting down".to_string()));
            }
        };

        for (task_id, release_error) in &event.release_errors {
            warn!(
                task = %task_id,
                environment = %id,
                error = %release_error,
                "task failed to release"
            );
        }
        Ok(event.release_errors.len())
    }

    /// Demultiplexer loop: the single consumer of the backend event stream.
    async fn run_demux(
        &self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.route_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("event demultiplexer stopped");
    }

    async fn route_event(&self, event: Event) {
        match event {
            Event::Device(device_event) => self.handle_device_event(device_event).await,
            Event::TasksReleased(released) => {
                // Must match an in-flight teardown; consumption closes the
                // channel. Unsolicited events are dropped.
                let sender = {
                    let mut registry = self.registry.write().await;
                    registry.pending_teardowns.remove(&released.environment_id)
                };
                match sender {
                    Some(sender) => {
                        let _ = sender.send(released);
                    }
                    None => debug!(
                        environment = %released.environment_id,
                        "dropping unsolicited tasks-released event"
                    ),
                }
            }
            Event::TasksStateChanged(changed) => {
                let registry = self.registry.read().await;
                match registry.pending_state_changes.get(&changed.environment_id) {
                    Some(sender) => {
                        let _ = sender.send(changed);
                    }
                    None => debug!(
                        environment = %changed.environment_id,
                        "dropping state change for unknown environment"
                    ),
                }
            }
        }
    }

    async fn handle_device_event(&self, event: DeviceEvent) {
        let Some(task) = self.task_control.task(&event.task_id) else {
            debug!(task = %event.task_id, "cannot find task for device event");
            return;
        };
        let env = {
            self.registry
                .read()
                .await
                .environments
                .get(&task.environment_id)
                .cloned()
        };
        let Some(env) = env else {
            error!(
                task = %event.task_id,
                environment = %task.environment_id,
                "cannot find environment for device event"
            );
            return;
        };

        if let DeviceEventKind::BasicTaskTerminated {
            exit_code,
            stdout,
            stderr,
            final_status,
        } = &event.kind
        {
            info!(
                exit_code,
                stdout,
                stderr,
                final_status,
                task = %event.task_id,
                "basic task terminated"
            );
            env.record_task_result(&event.task_id, *exit_code, stdout, stderr, final_status)
                .await;
            env.send_task_event(TaskEvent {
                task_id: event.task_id.clone(),
                name: task.role_name.clone(),
                class_name: task.class_name.clone(),
                hostname: task.hostname.clone(),
                status: final_status.clone(),
            });
        }

        if task.control_mode == ControlMode::Hook {
            env.notify_hook_event(event);
            return;
        }

        self.handle_termination_or_eos(&task, env);
    }

    /// Shared tail of BASIC_TASK_TERMINATED and END_OF_STREAM handling:
    /// once every task of a running environment reported the end of its
    /// data stream, stop the run asynchronously.
    fn handle_termination_or_eos(&self, task: &TaskDescriptor, env: Arc<Environment>) {
        if env.current_state() != EnvironmentState::Running {
            return;
        }
        self.task_control.set_safe_to_stop(&task.id);
        if env.is_safe_to_stop() {
            tokio::spawn(async move {
                if let Err(transition_error) = env.try_transition(Transition::stop()).await {
                    error!(
                        environment = %env.id(),
                        error = %transition_error,
                        "cannot stop run after end of stream"
                    );
                }
            });
        }
    }
}

/// Split input user variables: keys containing the role-target separator
/// belong to specific workflow roles and go to the loader; the rest are
/// environment-global.
fn partition_user_vars(
    user_vars: HashMap<String, String>,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut env_vars = HashMap::new();
    let mut workflow_vars = HashMap::new();
    for (key, value) in user_vars {
        if key.contains(TARGET_SEPARATOR) {
            workflow_vars.insert(key, value);
        } else {
            env_vars.insert(key, value);
        }
    }
    (env_vars, workflow_vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_user_vars() {
        let mut input = HashMap::new();
        input.insert("logLevel".to_string(), "debug".to_string());
        input.insert("readout.flp:rate".to_string(), "100".to_string());
        input.insert("epn.proc:threads".to_string(), "8".to_string());

        let (env_vars, workflow_vars) = partition_user_vars(input.clone());
        assert_eq!(env_vars.len(), 1);
        assert!(env_vars.contains_key("logLevel"));
        assert_eq!(workflow_vars.len(), 2);
        assert!(workflow_vars.contains_key("readout.flp:rate"));

        // The union equals the input
        let mut union = env_vars;
        union.extend(workflow_vars);
        assert_eq!(union, input);
    }

    #[test]
    fn test_partition_empty_map() {
        let (env_vars, workflow_vars) = partition_user_vars(HashMap::new());
        assert!(env_vars.is_empty());
        assert!(workflow_vars.is_empty());
    }
}
