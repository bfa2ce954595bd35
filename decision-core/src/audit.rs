//! Decision audit log over the durable stores.

use crate::types::Decision;
use mesh_store::{
    merge_decision_records, DecisionQuery, DecisionRecord, DurableStore, StoreError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5_000);
const MAX_PENDING_WRITES: usize = 1_000;

/// Decision rows the primary store has not accepted yet, one per decision.
struct PendingWrites {
    primary: Arc<dyn DurableStore>,
    queue: Mutex<VecDeque<DecisionRecord>>,
    running: AtomicBool,
}

impl PendingWrites {
    fn lock(&self) -> MutexGuard<'_, VecDeque<DecisionRecord>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Queue the latest row for a decision, replacing an older one.
    fn push(&self, record: DecisionRecord) {
        let mut queue = self.lock();
        if let Some(slot) = queue
            .iter_mut()
            .find(|r| r.decision_id == record.decision_id)
        {
            *slot = record;
            return;
        }
        queue.push_back(record);
        if queue.len() > MAX_PENDING_WRITES {
            if let Some(evicted) = queue.pop_front() {
                error!(
                    decision_id = %evicted.decision_id,
                    status = %evicted.status,
                    "Audit retry queue full, dropped oldest pending write"
                );
            }
        }
    }

    fn forget(&self, decision_id: &str) {
        self.lock().retain(|r| r.decision_id != decision_id);
    }

    /// Replay queued rows against the primary. Returns how many remain.
    async fn drain(&self) -> usize {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return 0;
        }

        let mut failed = Vec::new();
        let mut replayed = 0;
        for record in batch {
            match self.primary.upsert_decision(&record).await {
                Ok(()) => replayed += 1,
                Err(StoreError::TerminalStateFrozen(id)) => {
                    debug!(decision_id = %id, "Primary already holds the settled decision");
                }
                Err(e) => {
                    debug!(decision_id = %record.decision_id, error = %e, "Audit replay failed");
                    failed.push(record);
                }
            }
        }

        let mut queue = self.lock();
        for record in failed.into_iter().rev() {
            // A newer row queued during the replay supersedes this one.
            if !queue.iter().any(|r| r.decision_id == record.decision_id) {
                queue.push_front(record);
            }
        }
        if replayed > 0 {
            info!(replayed, remaining = queue.len(), "Audit writes replayed to primary store");
        }
        queue.len()
    }
}

async fn run_replay(pending: Arc<PendingWrites>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if pending.drain().await > 0 {
            continue;
        }
        pending.running.store(false, Ordering::SeqCst);
        // A write queued after the drain may have found the worker still running.
        if pending.len() == 0 || pending.running.swap(true, Ordering::SeqCst) {
            break;
        }
    }
    debug!("Audit replay worker stopped");
}

/// Writes decision records to the primary store, falling back to local.
///
/// Rows the primary rejects are kept locally and replayed to the primary on
/// a timer until it accepts them. Audit failures are logged and never
/// surface to callers.
pub struct DecisionAudit {
    primary: Arc<dyn DurableStore>,
    local: Arc<dyn DurableStore>,
    pending: Arc<PendingWrites>,
    retry_interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DecisionAudit {
    pub fn new(primary: Arc<dyn DurableStore>, local: Arc<dyn DurableStore>) -> Self {
        Self {
            pending: Arc::new(PendingWrites {
                primary: Arc::clone(&primary),
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
            }),
            primary,
            local,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    /// Set how often rejected writes are replayed.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Upsert the current state of a decision.
    pub async fn record(&self, decision: &Decision) {
        let record = decision.to_record();

        match self.primary.upsert_decision(&record).await {
            Ok(()) => {
                self.pending.forget(&record.decision_id);
                debug!(decision_id = %record.decision_id, status = %record.status, "Decision audited");
                return;
            }
            Err(StoreError::TerminalStateFrozen(id)) => {
                self.pending.forget(&id);
                warn!(decision_id = %id, status = %record.status, "Audit rejected write to settled decision");
                return;
            }
            Err(e) => warn!(
                decision_id = %record.decision_id,
                store = %self.primary.name(),
                error = %e,
                "Audit write failed, using local store"
            ),
        }

        if let Err(e) = self.local.upsert_decision(&record).await {
            warn!(
                decision_id = %record.decision_id,
                store = %self.local.name(),
                error = %e,
                "Local audit write failed"
            );
        }
        self.pending.push(record);
        self.start_replay();
    }

    fn start_replay(&self) {
        if self.pending.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(run_replay(Arc::clone(&self.pending), self.retry_interval));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Replay rejected writes now instead of waiting for the timer.
    /// Returns how many are still waiting.
    pub async fn flush(&self) -> usize {
        self.pending.drain().await
    }

    /// Writes the primary store has not accepted yet.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Newest-first history merged from both stores. A settled row wins over
    /// an in-flight one for the same decision.
    pub async fn history(&self, query: &DecisionQuery) -> Vec<DecisionRecord> {
        if self.pending.len() > 0 {
            self.flush().await;
        }

        let primary = self.primary.query_decisions(query).await;
        let local = self.local.query_decisions(query).await;
        let records = match (primary, local) {
            (Ok(mut records), Ok(local)) => {
                records.extend(local);
                records
            }
            (Ok(records), Err(e)) => {
                debug!(error = %e, "Local audit read failed");
                records
            }
            (Err(e), Ok(local)) => {
                warn!(error = %e, "Audit read failed, using local store");
                local
            }
            (Err(_), Err(e)) => {
                warn!(error = %e, "Decision history unavailable");
                return Vec::new();
            }
        };
        merge_decision_records(records, query.limit)
    }

    /// Whether either store holds the decision.
    pub async fn contains(&self, decision_id: &str) -> bool {
        if let Ok(true) = self.primary.contains_decision(decision_id).await {
            return true;
        }
        matches!(self.local.contains_decision(decision_id).await, Ok(true))
    }

    /// Stop the replay worker. Queued writes stay in the local store.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.pending.running.store(false, Ordering::SeqCst);
    }
}
