//! Error types for the context mesh.

/// Errors surfaced by [`ContextMesh`](crate::ContextMesh) operations.
///
/// Store failures never appear here: writes are queued for retry and reads
/// degrade to an empty result.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Message rejected before fan-out
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Subscription rejected
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Handlers faulted while `strict_handlers` is enabled
    #[error("Publish error: {count} handler(s) failed, first: {first}")]
    Publish {
        /// Number of failing handlers
        count: usize,
        /// First failure message
        first: String,
    },

    /// Operation attempted after shutdown
    #[error("Context mesh has been shut down")]
    ShutDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(#[from] serde_yaml::Error),
}

/// Failure reported by a subscriber handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
