//! Configuration for the decision core and the full stack.

use crate::error::Result;
use crate::types::Scenario;
use context_mesh::{ContextType, MeshConfig};
use mesh_store::{DurableStore, MemoryStore, SqliteStore, TieredStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Decision core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Timeout for local execution when a rule sets none (ms)
    #[serde(default = "default_local_timeout_ms")]
    pub local_timeout_ms: u64,

    /// Time an escalated decision may stay unresolved (ms)
    #[serde(default = "default_escalated_timeout_ms")]
    pub escalated_timeout_ms: u64,

    /// Per-scenario simulation timeout (ms)
    #[serde(default = "default_simulation_timeout_ms")]
    pub simulation_timeout_ms: u64,

    /// Scenario menu run on escalation
    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<Scenario>,

    /// Abort actions that outlive their timeout
    #[serde(default)]
    pub cancel_on_timeout: bool,

    /// Mesh context types cached for situational enrichment
    #[serde(default = "default_observed_context_types")]
    pub observed_context_types: Vec<ContextType>,

    /// Context type used when publishing decision facts
    #[serde(default = "default_decision_context_type")]
    pub decision_context_type: ContextType,
}

fn default_local_timeout_ms() -> u64 {
    5_000
}

fn default_escalated_timeout_ms() -> u64 {
    30_000
}

fn default_simulation_timeout_ms() -> u64 {
    2_000
}

fn default_scenarios() -> Vec<Scenario> {
    Scenario::ALL.to_vec()
}

fn default_observed_context_types() -> Vec<ContextType> {
    vec![ContextType::Risk, ContextType::Mission]
}

fn default_decision_context_type() -> ContextType {
    ContextType::Ai
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            local_timeout_ms: default_local_timeout_ms(),
            escalated_timeout_ms: default_escalated_timeout_ms(),
            simulation_timeout_ms: default_simulation_timeout_ms(),
            scenarios: default_scenarios(),
            cancel_on_timeout: false,
            observed_context_types: default_observed_context_types(),
            decision_context_type: default_decision_context_type(),
        }
    }
}

impl DecisionConfig {
    pub fn local_timeout(&self) -> Duration {
        Duration::from_millis(self.local_timeout_ms)
    }

    pub fn escalated_timeout(&self) -> Duration {
        Duration::from_millis(self.escalated_timeout_ms)
    }

    pub fn simulation_timeout(&self) -> Duration {
        Duration::from_millis(self.simulation_timeout_ms)
    }
}

/// Local persistence tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Records held by the ephemeral tier before spilling to SQLite
    #[serde(default = "default_ephemeral_capacity")]
    pub ephemeral_capacity: usize,

    /// SQLite file for the transactional tier; in-memory when unset
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

fn default_ephemeral_capacity() -> usize {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ephemeral_capacity: default_ephemeral_capacity(),
            sqlite_path: None,
        }
    }
}

impl StorageConfig {
    /// Build the tiered local store: ephemeral memory over SQLite.
    pub fn open_local(&self) -> Result<Arc<dyn DurableStore>> {
        let ephemeral = Arc::new(MemoryStore::new("ephemeral").with_capacity(self.ephemeral_capacity));
        let sqlite = match &self.sqlite_path {
            Some(path) => SqliteStore::open(path)?,
            None => SqliteStore::open_in_memory()?,
        };
        Ok(Arc::new(TieredStore::new(ephemeral, Arc::new(sqlite))))
    }
}

/// Configuration for the whole stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl CoreConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DecisionConfig::default();
        assert_eq!(config.local_timeout_ms, 5_000);
        assert_eq!(config.escalated_timeout_ms, 30_000);
        assert_eq!(config.scenarios.len(), 5);
        assert!(!config.cancel_on_timeout);
        assert_eq!(config.decision_context_type, ContextType::Ai);
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let config = CoreConfig::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = CoreConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
decision:
  local_timeout_ms: 750
  scenarios: [balanced, high_risk]
  observed_context_types: [risk, telemetry]
storage:
  ephemeral_capacity: 64
"#;
        let config = CoreConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.decision.local_timeout(), Duration::from_millis(750));
        assert_eq!(config.decision.scenarios, vec![Scenario::Balanced, Scenario::HighRisk]);
        assert_eq!(
            config.decision.observed_context_types,
            vec![ContextType::Risk, ContextType::Telemetry]
        );
        assert_eq!(config.decision.escalated_timeout_ms, 30_000);
        assert_eq!(config.storage.ephemeral_capacity, 64);
        assert_eq!(config.mesh, MeshConfig::default());
    }

    #[tokio::test]
    async fn test_open_local_file_backed() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = StorageConfig {
            ephemeral_capacity: 1,
            sqlite_path: Some(dir.path().join("local.db")),
        };
        let store = storage.open_local().unwrap();
        store.probe().await.unwrap();
        assert_eq!(store.name(), "tiered");
    }
}
