//! The durable store contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ContextQuery, ContextRecord, DecisionQuery, DecisionRecord};

/// Persistence backend for context and decision records.
///
/// The mesh and the decision core treat every implementation as replaceable:
/// a hosted database client, one of the local tiers in this crate, or a fake
/// in tests.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Check that the store is reachable.
    async fn probe(&self) -> Result<()>;

    /// Persist a context record, returning the identifier assigned to it.
    async fn insert_context(&self, record: ContextRecord) -> Result<String>;

    /// Read context records, newest first, bounded by `query.limit`.
    async fn query_contexts(&self, query: &ContextQuery) -> Result<Vec<ContextRecord>>;

    /// Insert or update a decision by id.
    ///
    /// Must fail with [`StoreError::TerminalStateFrozen`](crate::StoreError::TerminalStateFrozen)
    /// if the stored row already holds a terminal status.
    async fn upsert_decision(&self, record: &DecisionRecord) -> Result<()>;

    /// Whether a decision with this id is stored here.
    async fn contains_decision(&self, decision_id: &str) -> Result<bool>;

    /// Read decision records, newest first, bounded by `query.limit`.
    async fn query_decisions(&self, query: &DecisionQuery) -> Result<Vec<DecisionRecord>>;
}

/// Assign a fresh identifier if the record has none yet.
pub(crate) fn assign_id(record: &mut ContextRecord) -> String {
    if record.id.is_empty() {
        record.id = uuid::Uuid::new_v4().to_string();
    }
    record.id.clone()
}
