//! Error types for the store tiers.

/// Errors raised by a [`DurableStore`](crate::DurableStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached right now
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The tier is full and rejected the write
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A decision row already holds a terminal status
    #[error("Decision {0} already reached a terminal state")]
    TerminalStateFrozen(String),

    /// Context type label outside the closed set
    #[error("Unknown context type: {0}")]
    UnknownContextType(String),

    /// Sync status label outside the closed set
    #[error("Unknown sync status: {0}")]
    UnknownSyncStatus(String),

    /// SQLite failure in the transactional tier
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else (poisoned locks, corrupt rows)
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_)
                | StoreError::CapacityExceeded(_)
                | StoreError::Sqlite(_)
                | StoreError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
