//! Configuration for the Maestro core
//!
//! This module contains the tunables the manager and the integration
//! plugins read at construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Deadline in seconds for remote hook tasks to report completion
    #[serde(default = "default_hook_deadline_secs")]
    pub hook_deadline_secs: u64,

    /// Deadline in seconds for calls to external integration services
    #[serde(default = "default_integration_call_deadline_secs")]
    pub integration_call_deadline_secs: u64,
}

fn default_hook_deadline_secs() -> u64 {
    30
}

fn default_integration_call_deadline_secs() -> u64 {
    10
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hook_deadline_secs: default_hook_deadline_secs(),
            integration_call_deadline_secs: default_integration_call_deadline_secs(),
        }
    }
}

impl CoreConfig {
    /// Hook completion deadline as a [`Duration`]
    pub fn hook_deadline(&self) -> Duration {
        Duration::from_secs(self.hook_deadline_secs)
    }

    /// Integration call deadline as a [`Duration`]
    pub fn integration_call_deadline(&self) -> Duration {
        Duration::from_secs(self.integration_call_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.hook_deadline(), Duration::from_secs(30));
        assert_eq!(config.integration_call_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{"hook_deadline_secs": 5}"#).unwrap();
        assert_eq!(config.hook_deadline_secs, 5);
        assert_eq!(config.integration_call_deadline_secs, 10);
    }
}
