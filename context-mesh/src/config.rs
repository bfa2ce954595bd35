//! Configuration for the context mesh.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Context mesh configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Interval between retry drains (ms)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Maximum pending messages held for retry; oldest are evicted beyond it
    #[serde(default = "default_max_retry_queue")]
    pub max_retry_queue: usize,

    /// Fail `publish` when any handler faults (fan-out still completes)
    #[serde(default)]
    pub strict_handlers: bool,
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_max_retry_queue() -> usize {
    100
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            max_retry_queue: default_max_retry_queue(),
            strict_handlers: false,
        }
    }
}

impl MeshConfig {
    /// Retry interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
