//! Integration plugin seams.
//!
//! Integration plugins bridge transitions to external services downstream
//! of the control plane. A plugin exposes named in-process callables that
//! a workflow loader attaches to call-hook roles; every outbound call to
//! the external service carries a bounded deadline.

use crate::domain::workflow::HookCall;
use crate::error::CoreError;
use crate::types::EnvironmentId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Partition scheduler integration
pub mod partition;

/// A plugin integrating an external service into the environment lifecycle
#[async_trait]
pub trait IntegrationPlugin: Send + Sync {
    /// Stable plugin name
    fn name(&self) -> &str;

    /// Prepare the plugin for an environment, e.g. verify connectivity
    async fn init(&self, environment_id: &EnvironmentId) -> Result<(), CoreError>;

    /// Release any resources held by the plugin
    async fn destroy(&self) -> Result<(), CoreError>;

    /// Named callables to attach to workflow call-hook roles.
    ///
    /// The var stack is the environment's user-variable snapshot; it always
    /// contains `environment_id`.
    fn call_hooks(
        &self,
        var_stack: HashMap<String, String>,
    ) -> Vec<(String, Arc<dyn HookCall>)>;
}
