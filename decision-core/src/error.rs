//! Error types for the decision core.

use context_mesh::MeshError;
use mesh_store::StoreError;

/// Decision core errors.
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Duplicate rule id: {0}")]
    DuplicateRule(String),

    #[error("Invalid decision context: {0}")]
    InvalidContext(String),

    /// A rule condition could not be evaluated
    #[error("Condition error: {0}")]
    Condition(String),

    /// A rule action failed
    #[error("Action error: {0}")]
    Action(String),

    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error("Unknown decision: {0}")]
    UnknownDecision(String),

    #[error("Decision already settled: {0}")]
    AlreadyTerminal(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, DecisionError>;
