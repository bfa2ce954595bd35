//! Local persistence path: fast ephemeral tier first, transactional tier second.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::DurableStore;
use crate::types::{
    merge_context_records, merge_decision_records, ContextQuery, ContextRecord, DecisionQuery,
    DecisionRecord,
};

/// Two-tier local store used when the durable store is unreachable.
///
/// Writes land in the ephemeral tier and fall back to the transactional tier
/// when it rejects them. Reads merge both tiers.
pub struct TieredStore {
    ephemeral: Arc<dyn DurableStore>,
    transactional: Arc<dyn DurableStore>,
}

impl TieredStore {
    /// Combine an ephemeral and a transactional tier.
    pub fn new(ephemeral: Arc<dyn DurableStore>, transactional: Arc<dyn DurableStore>) -> Self {
        Self {
            ephemeral,
            transactional,
        }
    }

    async fn upsert_with_fallback(&self, record: &DecisionRecord) -> Result<()> {
        match self.ephemeral.upsert_decision(record).await {
            Ok(()) => Ok(()),
            Err(e @ StoreError::TerminalStateFrozen(_)) => Err(e),
            Err(e) => {
                warn!(
                    tier = %self.ephemeral.name(),
                    decision_id = %record.decision_id,
                    error = %e,
                    "Ephemeral tier rejected decision record, using transactional tier"
                );
                self.transactional.upsert_decision(record).await
            }
        }
    }
}

/// Read from both tiers, tolerating one failed tier.
async fn read_both<T, F, Fut>(
    ephemeral: &Arc<dyn DurableStore>,
    transactional: &Arc<dyn DurableStore>,
    read: F,
) -> Result<Vec<T>>
where
    F: Fn(Arc<dyn DurableStore>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<T>>>,
{
    let first = read(Arc::clone(ephemeral)).await;
    let second = read(Arc::clone(transactional)).await;

    match (first, second) {
        (Ok(mut a), Ok(b)) => {
            a.extend(b);
            Ok(a)
        }
        (Ok(a), Err(e)) => {
            warn!(tier = %transactional.name(), error = %e, "Transactional tier read failed");
            Ok(a)
        }
        (Err(e), Ok(b)) => {
            warn!(tier = %ephemeral.name(), error = %e, "Ephemeral tier read failed");
            Ok(b)
        }
        (Err(_), Err(e)) => Err(e),
    }
}

#[async_trait]
impl DurableStore for TieredStore {
    fn name(&self) -> &str {
        "tiered"
    }

    async fn probe(&self) -> Result<()> {
        match self.ephemeral.probe().await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(tier = %self.ephemeral.name(), error = %e, "Ephemeral tier probe failed");
                self.transactional.probe().await
            }
        }
    }

    async fn insert_context(&self, record: ContextRecord) -> Result<String> {
        match self.ephemeral.insert_context(record.clone()).await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(
                    tier = %self.ephemeral.name(),
                    module = %record.module_name,
                    error = %e,
                    "Ephemeral tier rejected context record, using transactional tier"
                );
                self.transactional.insert_context(record).await
            }
        }
    }

    async fn query_contexts(&self, query: &ContextQuery) -> Result<Vec<ContextRecord>> {
        let merged = read_both(&self.ephemeral, &self.transactional, |tier| async move {
            tier.query_contexts(query).await
        })
        .await?;

        Ok(merge_context_records(merged, query.limit))
    }

    async fn upsert_decision(&self, record: &DecisionRecord) -> Result<()> {
        // Keep a decision in the tier that already holds it.
        if self
            .transactional
            .contains_decision(&record.decision_id)
            .await
            .unwrap_or(false)
        {
            return self.transactional.upsert_decision(record).await;
        }
        self.upsert_with_fallback(record).await
    }

    async fn contains_decision(&self, decision_id: &str) -> Result<bool> {
        if self
            .ephemeral
            .contains_decision(decision_id)
            .await
            .unwrap_or(false)
        {
            return Ok(true);
        }
        self.transactional.contains_decision(decision_id).await
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> Result<Vec<DecisionRecord>> {
        let merged = read_both(&self.ephemeral, &self.transactional, |tier| async move {
            tier.query_decisions(query).await
        })
        .await?;

        // A decision that moved tiers mid-flight may appear twice; the terminal copy wins.
        Ok(merge_decision_records(merged, query.limit))
    }
}
