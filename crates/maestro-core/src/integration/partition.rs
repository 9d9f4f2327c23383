//! Downstream partition scheduler integration.
//!
//! The partition scheduler is the downstream data-distribution service's
//! view of an environment; the partition id equals the environment id. The
//! plugin exposes `PartitionInitialize` and `PartitionTerminate` call-hooks
//! that a workflow attaches to its configure and destroy phases.

use crate::domain::workflow::HookCall;
use crate::error::CoreError;
use crate::integration::IntegrationPlugin;
use crate::types::EnvironmentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// State the partition scheduler reports for a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    /// The partition is being set up
    Configuring,
    /// The partition is shutting down
    Terminating,
    /// Any other reported state
    Unknown,
}

/// Request payload for partition lifecycle calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRequest {
    /// Environment the partition belongs to
    pub environment_id: String,
    /// Partition id; always equal to the environment id
    pub partition_id: String,
    /// Data source host-id map, keyed by hostname
    pub source_host_map: HashMap<String, String>,
    /// Data sink host-id map, keyed by hostname
    pub sink_host_map: HashMap<String, String>,
}

/// Reply payload of partition lifecycle calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReply {
    /// State the scheduler reports after the call
    pub state: PartitionState,
}

/// Client for the partition scheduler service
#[async_trait]
pub trait PartitionClient: Send + Sync {
    /// Initialize the partition for an environment
    async fn partition_initialize(
        &self,
        request: PartitionRequest,
    ) -> Result<PartitionReply, CoreError>;

    /// Terminate the partition of an environment
    async fn partition_terminate(
        &self,
        request: PartitionRequest,
    ) -> Result<PartitionReply, CoreError>;
}

/// Integration plugin for the downstream partition scheduler
pub struct PartitionPlugin {
    client: Arc<dyn PartitionClient>,
    call_deadline: Duration,
}

impl PartitionPlugin {
    /// Build the plugin around a connected client
    pub fn new(client: Arc<dyn PartitionClient>, call_deadline: Duration) -> Self {
        Self {
            client,
            call_deadline,
        }
    }
}

#[async_trait]
impl IntegrationPlugin for PartitionPlugin {
    fn name(&self) -> &str {
        "partition"
    }

    async fn init(&self, environment_id: &EnvironmentId) -> Result<(), CoreError> {
        debug!(environment = %environment_id, "partition plugin ready");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn call_hooks(
        &self,
        var_stack: HashMap<String, String>,
    ) -> Vec<(String, Arc<dyn HookCall>)> {
        vec![
            (
                "PartitionInitialize".to_string(),
                Arc::new(PartitionInitialize {
                    client: self.client.clone(),
                    call_deadline: self.call_deadline,
                    var_stack: var_stack.clone(),
                }) as Arc<dyn HookCall>,
            ),
            (
                "PartitionTerminate".to_string(),
                Arc::new(PartitionTerminate {
                    client: self.client.clone(),
                    call_deadline: self.call_deadline,
                    var_stack,
                }) as Arc<dyn HookCall>,
            ),
        ]
    }
}

fn request_from_vars(var_stack: &HashMap<String, String>) -> Result<PartitionRequest, CoreError> {
    let environment_id = var_stack
        .get("environment_id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            CoreError::HookFailed("cannot acquire environment id for partition call".to_string())
        })?;

    Ok(PartitionRequest {
        environment_id: environment_id.clone(),
        partition_id: environment_id.clone(),
        source_host_map: host_map_from_var(var_stack, "source_host_map")?,
        sink_host_map: host_map_from_var(var_stack, "sink_host_map")?,
    })
}

fn host_map_from_var(
    var_stack: &HashMap<String, String>,
    key: &str,
) -> Result<HashMap<String, String>, CoreError> {
    let Some(raw) = var_stack.get(key) else {
        debug!(var = key, "no host map set");
        return Ok(HashMap::new());
    };
    serde_json::from_str(raw)
        .map_err(|parse_error| CoreError::HookFailed(format!("error processing {key}: {parse_error}")))
}

/// Call-hook performing partition initialization
struct PartitionInitialize {
    client: Arc<dyn PartitionClient>,
    call_deadline: Duration,
    var_stack: HashMap<String, String>,
}

#[async_trait]
impl HookCall for PartitionInitialize {
    async fn call(&self) -> Result<(), CoreError> {
        debug!("performing partition scheduler initialize");
        let request = request_from_vars(&self.var_stack)?;

        let reply = tokio::time::timeout(
            self.call_deadline,
            self.client.partition_initialize(request),
        )
        .await
        .map_err(|_| CoreError::HookFailed("partition initialize timed out".to_string()))??;

        if reply.state != PartitionState::Configuring {
            error!(state = ?reply.state, "partition initialize returned unexpected state");
            return Err(CoreError::HookFailed(format!(
                "partition initialize returned unexpected state {:?} (expected: CONFIGURING)",
                reply.state
            )));
        }
        Ok(())
    }
}

/// Call-hook performing partition termination
struct PartitionTerminate {
    client: Arc<dyn PartitionClient>,
    call_deadline: Duration,
    var_stack: HashMap<String, String>,
}

#[async_trait]
impl HookCall for PartitionTerminate {
    async fn call(&self) -> Result<(), CoreError> {
        debug!("performing partition scheduler terminate");
        let request = request_from_vars(&self.var_stack)?;

        let reply = tokio::time::timeout(
            self.call_deadline,
            self.client.partition_terminate(request),
        )
        .await
        .map_err(|_| CoreError::HookFailed("partition terminate timed out".to_string()))??;

        if reply.state != PartitionState::Terminating {
            error!(state = ?reply.state, "partition terminate returned unexpected state");
            return Err(CoreError::HookFailed(format!(
                "partition terminate returned unexpected state {:?} (expected: TERMINATING)",
                reply.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockClient {
        reply_state: PartitionState,
        delay: Option<Duration>,
        requests: Mutex<Vec<PartitionRequest>>,
    }

    impl MockClient {
        fn new(reply_state: PartitionState) -> Arc<Self> {
            Arc::new(Self {
                reply_state,
                delay: None,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn slow(reply_state: PartitionState, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply_state,
                delay: Some(delay),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PartitionClient for MockClient {
        async fn partition_initialize(
            &self,
            request: PartitionRequest,
        ) -> Result<PartitionReply, CoreError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.requests.lock().unwrap().push(request);
            Ok(PartitionReply {
                state: self.reply_state,
            })
        }

        async fn partition_terminate(
            &self,
            request: PartitionRequest,
        ) -> Result<PartitionReply, CoreError> {
            self.requests.lock().unwrap().push(request);
            Ok(PartitionReply {
                state: self.reply_state,
            })
        }
    }

    fn var_stack(env_id: &str) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("environment_id".to_string(), env_id.to_string());
        vars
    }

    fn hook_named(
        plugin: &PartitionPlugin,
        vars: HashMap<String, String>,
        name: &str,
    ) -> Arc<dyn HookCall> {
        plugin
            .call_hooks(vars)
            .into_iter()
            .find(|(hook_name, _)| hook_name == name)
            .map(|(_, hook)| hook)
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_uses_environment_id_as_partition_id() {
        let client = MockClient::new(PartitionState::Configuring);
        let plugin = PartitionPlugin::new(client.clone(), Duration::from_secs(1));

        let mut vars = var_stack("env-1");
        vars.insert(
            "source_host_map".to_string(),
            r#"{"host-a": "0"}"#.to_string(),
        );
        let hook = hook_named(&plugin, vars, "PartitionInitialize");
        hook.call().await.unwrap();

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].environment_id, "env-1");
        assert_eq!(requests[0].partition_id, "env-1");
        assert_eq!(requests[0].source_host_map.get("host-a"), Some(&"0".to_string()));
        assert!(requests[0].sink_host_map.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_state_fails_the_hook() {
        let client = MockClient::new(PartitionState::Unknown);
        let plugin = PartitionPlugin::new(client, Duration::from_secs(1));

        let hook = hook_named(&plugin, var_stack("env-1"), "PartitionInitialize");
        assert!(matches!(hook.call().await, Err(CoreError::HookFailed(_))));
    }

    #[tokio::test]
    async fn test_missing_environment_id_fails_the_hook() {
        let client = MockClient::new(PartitionState::Configuring);
        let plugin = PartitionPlugin::new(client, Duration::from_secs(1));

        let hook = hook_named(&plugin, HashMap::new(), "PartitionInitialize");
        assert!(matches!(hook.call().await, Err(CoreError::HookFailed(_))));
    }

    #[tokio::test]
    async fn test_malformed_host_map_fails_the_hook() {
        let client = MockClient::new(PartitionState::Configuring);
        let plugin = PartitionPlugin::new(client, Duration::from_secs(1));

        let mut vars = var_stack("env-1");
        vars.insert("source_host_map".to_string(), "not json".to_string());
        let hook = hook_named(&plugin, vars, "PartitionInitialize");
        assert!(matches!(hook.call().await, Err(CoreError::HookFailed(_))));
    }

    #[tokio::test]
    async fn test_call_deadline_is_enforced() {
        let client = MockClient::slow(PartitionState::Configuring, Duration::from_secs(60));
        let plugin = PartitionPlugin::new(client, Duration::from_millis(20));

        let hook = hook_named(&plugin, var_stack("env-1"), "PartitionInitialize");
        let result = hook.call().await;
        assert!(matches!(result, Err(CoreError::HookFailed(message)) if message.contains("timed out")));
    }

    #[tokio::test]
    async fn test_terminate_verifies_state() {
        let client = MockClient::new(PartitionState::Terminating);
        let deadline = crate::CoreConfig::default().integration_call_deadline();
        let plugin = PartitionPlugin::new(client.clone(), deadline);

        let hook = hook_named(&plugin, var_stack("env-9"), "PartitionTerminate");
        hook.call().await.unwrap();
        assert_eq!(client.requests.lock().unwrap()[0].partition_id, "env-9");
    }
}
