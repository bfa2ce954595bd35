//! Fast ephemeral tier held entirely in memory.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::store::{assign_id, DurableStore};
use crate::types::{ContextQuery, ContextRecord, DecisionQuery, DecisionRecord};

/// In-memory store.
///
/// Doubles as the ephemeral tier of [`TieredStore`](crate::TieredStore) and as
/// a fake durable store in tests: `set_available(false)` makes every call fail
/// with [`StoreError::Unavailable`], and an optional capacity makes writes fail
/// with [`StoreError::CapacityExceeded`] once the tier is full.
pub struct MemoryStore {
    name: String,
    capacity: Option<usize>,
    available: AtomicBool,
    contexts: RwLock<Vec<ContextRecord>>,
    decisions: RwLock<Vec<DecisionRecord>>,
    write_count: AtomicUsize,
}

impl MemoryStore {
    /// Create an unbounded, available store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            available: AtomicBool::new(true),
            contexts: RwLock::new(Vec::new()),
            decisions: RwLock::new(Vec::new()),
            write_count: AtomicUsize::new(0),
        }
    }

    /// Bound the number of records (contexts plus decisions) this tier holds.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set initial availability.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Flip availability at runtime.
    pub fn set_available(&self, available: bool) {
        debug!(store = %self.name, available, "Memory store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current availability.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of successful writes (context inserts and decision upserts).
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Number of stored context records.
    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "memory store '{}' is offline",
                self.name
            )))
        }
    }

    async fn ensure_room(&self) -> Result<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };
        let used = self.contexts.read().await.len() + self.decisions.read().await.len();
        if used >= capacity {
            return Err(StoreError::CapacityExceeded(format!(
                "memory store '{}' holds {} of {} records",
                self.name, used, capacity
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn insert_context(&self, mut record: ContextRecord) -> Result<String> {
        self.ensure_available()?;
        self.ensure_room().await?;

        let id = assign_id(&mut record);
        trace!(store = %self.name, id = %id, module = %record.module_name, "Storing context record");
        self.contexts.write().await.push(record);
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn query_contexts(&self, query: &ContextQuery) -> Result<Vec<ContextRecord>> {
        self.ensure_available()?;
        let contexts = self.contexts.read().await;
        // Reverse first so equal timestamps keep newest-inserted first after the stable sort.
        let mut matching: Vec<ContextRecord> = contexts
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(query.limit);
        Ok(matching)
    }

    async fn upsert_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.ensure_available()?;

        let exists = {
            let decisions = self.decisions.read().await;
            match decisions.iter().find(|d| d.decision_id == record.decision_id) {
                Some(existing) if existing.is_terminal() => {
                    return Err(StoreError::TerminalStateFrozen(record.decision_id.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };
        if !exists {
            self.ensure_room().await?;
        }

        let mut decisions = self.decisions.write().await;
        match decisions
            .iter_mut()
            .find(|d| d.decision_id == record.decision_id)
        {
            Some(existing) if existing.is_terminal() => {
                return Err(StoreError::TerminalStateFrozen(record.decision_id.clone()));
            }
            Some(existing) => *existing = record.clone(),
            None => decisions.push(record.clone()),
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn contains_decision(&self, decision_id: &str) -> Result<bool> {
        self.ensure_available()?;
        let decisions = self.decisions.read().await;
        Ok(decisions.iter().any(|d| d.decision_id == decision_id))
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> Result<Vec<DecisionRecord>> {
        self.ensure_available()?;
        let decisions = self.decisions.read().await;
        let mut matching: Vec<DecisionRecord> = decisions
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(query.limit);
        Ok(matching)
    }
}
