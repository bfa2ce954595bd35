//! The context mesh: synchronous fan-out, asynchronous persistence, retry.

use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::registry::SubscriberRegistry;
use crate::retry::RetryQueue;
use crate::types::{
    ContextMessage, ContextSubscription, HandlerFault, MeshMode, PublishReceipt, SubscriptionId,
};
use mesh_store::{
    merge_context_records, ContextQuery, ContextType, DurableStore, StoreError, SyncStatus,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State shared with the background workers.
struct Shared {
    primary: Arc<dyn DurableStore>,
    local: Arc<dyn DurableStore>,
    retry: RetryQueue,
    local_mode: AtomicBool,
}

/// Summary of one retry drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Messages written during this cycle
    pub persisted: usize,
    /// Messages put back for the next cycle
    pub requeued: usize,
    /// Messages evicted because the queue overflowed
    pub dropped: usize,
}

impl Shared {
    fn mode(&self) -> MeshMode {
        if self.local_mode.load(Ordering::SeqCst) {
            MeshMode::Local
        } else {
            MeshMode::Remote
        }
    }

    fn set_mode(&self, mode: MeshMode) {
        self.local_mode
            .store(mode == MeshMode::Local, Ordering::SeqCst);
    }

    /// Write one message to whichever tier the current mode selects.
    async fn persist(
        &self,
        mut message: ContextMessage,
    ) -> std::result::Result<String, (ContextMessage, StoreError)> {
        let (store, status) = match self.mode() {
            MeshMode::Remote => (&self.primary, SyncStatus::Synced),
            MeshMode::Local => (&self.local, SyncStatus::Pending),
        };

        let mut record = message.to_record();
        record.id.clear();
        record.sync_status = status;

        match store.insert_context(record).await {
            Ok(id) => Ok(id),
            Err(e) => {
                message.sync_status = SyncStatus::Pending;
                Err((message, e))
            }
        }
    }

    async fn persist_or_queue(&self, message: ContextMessage) {
        match self.persist(message).await {
            Ok(id) => debug!(record_id = %id, mode = %self.mode(), "Context persisted"),
            Err((message, e)) => {
                warn!(
                    module = %message.module_name,
                    context_type = %message.context_type,
                    error = %e,
                    "Durable write failed, queued for retry"
                );
                self.enqueue_retry(message);
            }
        }
    }

    fn enqueue_retry(&self, message: ContextMessage) {
        if let Some(evicted) = self.retry.push(message) {
            log_dropped(&evicted);
        }
    }

    async fn retry_cycle(&self) -> RetryReport {
        if self.mode() == MeshMode::Local {
            match self.primary.probe().await {
                Ok(()) => {
                    self.set_mode(MeshMode::Remote);
                    info!(store = %self.primary.name(), "Durable store reachable again, leaving local mode");
                }
                Err(e) => debug!(error = %e, "Durable store still unreachable"),
            }
        }

        let batch = self.retry.take_all();
        if batch.is_empty() {
            return RetryReport::default();
        }

        let mut report = RetryReport::default();
        let mut failed = Vec::new();
        for message in batch {
            match self.persist(message).await {
                Ok(_) => report.persisted += 1,
                Err((message, e)) => {
                    debug!(module = %message.module_name, error = %e, "Retry write failed");
                    failed.push(message);
                }
            }
        }

        report.requeued = failed.len();
        let overflow = self.retry.requeue_front(failed);
        report.dropped = overflow.len();
        report.requeued -= report.dropped.min(report.requeued);
        for evicted in &overflow {
            log_dropped(evicted);
        }

        info!(
            persisted = report.persisted,
            requeued = report.requeued,
            dropped = report.dropped,
            mode = %self.mode(),
            "Retry cycle finished"
        );
        report
    }
}

fn log_dropped(message: &ContextMessage) {
    error!(
        module = %message.module_name,
        context_type = %message.context_type,
        sync_status = %SyncStatus::Failed,
        "Retry queue full, dropped oldest pending message"
    );
}

#[derive(Default)]
struct Workers {
    persist_tx: Option<mpsc::UnboundedSender<ContextMessage>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

/// In-process pub/sub bus for situational context.
///
/// Fan-out runs synchronously on the publisher's stack in subscription order.
/// Durable writes happen on a single background worker, so they are ordered
/// per mesh but never block `publish`. Failed writes go to a bounded retry
/// queue drained on a timer.
pub struct ContextMesh {
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    subscribers: SubscriberRegistry,
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl ContextMesh {
    /// Create a mesh. `primary` is the durable store; `local` receives writes
    /// while the primary is unreachable.
    pub fn new(
        config: MeshConfig,
        primary: Arc<dyn DurableStore>,
        local: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryQueue::new(config.max_retry_queue);
        Self {
            config,
            clock,
            subscribers: SubscriberRegistry::default(),
            shared: Arc::new(Shared {
                primary,
                local,
                retry,
                local_mode: AtomicBool::new(false),
            }),
            workers: Mutex::new(Workers::default()),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Probe the durable store, pick the mode and start the workers.
    ///
    /// Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<MeshMode> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MeshError::ShutDown);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("Context mesh already initialized");
            return Ok(self.mode());
        }

        match self.shared.primary.probe().await {
            Ok(()) => self.shared.set_mode(MeshMode::Remote),
            Err(e) => {
                warn!(
                    store = %self.shared.primary.name(),
                    error = %e,
                    "Durable store unreachable, using local persistence"
                );
                self.shared.set_mode(MeshMode::Local);
            }
        }

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let persistence = tokio::spawn(run_persistence(Arc::clone(&self.shared), persist_rx));
        let retry = tokio::spawn(run_retry(
            Arc::clone(&self.shared),
            self.config.retry_interval(),
            shutdown_rx,
        ));

        {
            let mut workers = self.lock_workers();
            workers.persist_tx = Some(persist_tx);
            workers.shutdown_tx = Some(shutdown_tx);
            workers.handles = vec![persistence, retry];
        }

        info!(
            mode = %self.mode(),
            retry_interval_ms = self.config.retry_interval_ms,
            max_retry_queue = self.config.max_retry_queue,
            "Context mesh initialized"
        );
        Ok(self.mode())
    }

    /// Deliver a message to every subscriber of its type, then hand it to the
    /// persistence worker.
    ///
    /// Handler errors and panics are isolated: remaining handlers still run
    /// and the faults are listed in the receipt.
    pub fn publish(&self, mut message: ContextMessage) -> Result<PublishReceipt> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MeshError::ShutDown);
        }
        if message.module_name.trim().is_empty() {
            return Err(MeshError::InvalidMessage(
                "module_name must not be empty".to_string(),
            ));
        }

        if message.timestamp.is_none() {
            message.timestamp = Some(self.clock.now());
        }
        message.id.clear();
        message.sync_status = SyncStatus::Pending;

        let (delivered, faults) = self.fan_out(&message);
        self.hand_off(message.clone());

        debug!(
            module = %message.module_name,
            context_type = %message.context_type,
            delivered,
            faults = faults.len(),
            "Context published"
        );

        if self.config.strict_handlers {
            if let Some(first) = faults.first() {
                return Err(MeshError::Publish {
                    count: faults.len(),
                    first: first.error.clone(),
                });
            }
        }

        Ok(PublishReceipt {
            message,
            delivered,
            faults,
        })
    }

    fn fan_out(&self, message: &ContextMessage) -> (usize, Vec<HandlerFault>) {
        let mut delivered = 0;
        let mut faults = Vec::new();

        for subscriber in self.subscribers.subscribers_for(message.context_type) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.handler.handle(message)));
            let error = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
            };

            warn!(
                subscription_id = %subscriber.id,
                subscriber = %subscriber.module_name,
                module = %message.module_name,
                context_type = %message.context_type,
                error = %error,
                "Context handler failed"
            );
            faults.push(HandlerFault {
                subscription_id: subscriber.id.clone(),
                module_name: subscriber.module_name.clone(),
                error,
            });
        }

        (delivered, faults)
    }

    fn hand_off(&self, message: ContextMessage) {
        let workers = self.lock_workers();
        match &workers.persist_tx {
            Some(tx) => {
                if let Err(mpsc::error::SendError(message)) = tx.send(message) {
                    self.shared.enqueue_retry(message);
                }
            }
            // Not initialized yet: the retry worker picks these up once it starts.
            None => self.shared.enqueue_retry(message),
        }
    }

    /// Register a handler for one or more context types.
    pub fn subscribe(&self, subscription: ContextSubscription) -> Result<SubscriptionId> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MeshError::ShutDown);
        }
        if subscription.context_types.is_empty() {
            return Err(MeshError::InvalidSubscription(format!(
                "subscription for '{}' lists no context types",
                subscription.module_name
            )));
        }

        let module_name = subscription.module_name.clone();
        let types: Vec<_> = subscription.context_types.iter().map(|t| t.as_str()).collect();
        let id = self.subscribers.insert(subscription);
        info!(subscription_id = %id, subscriber = %module_name, context_types = ?types, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        match self.subscribers.remove(id) {
            Some(module_name) => {
                info!(subscription_id = %id, subscriber = %module_name, "Unsubscribed");
                true
            }
            None => {
                warn!(subscription_id = %id, "Unknown subscription");
                false
            }
        }
    }

    /// Most recent messages for a module, newest first.
    ///
    /// Merges the durable store with local persistence, so messages written
    /// locally during an outage stay visible after the store comes back.
    /// Local mode skips the durable store. Never fails: a total read failure
    /// yields an empty list.
    pub async fn get_context_history(
        &self,
        module_name: &str,
        context_type: Option<ContextType>,
        limit: usize,
    ) -> Vec<ContextMessage> {
        let mut query = ContextQuery::new(module_name, limit);
        if let Some(context_type) = context_type {
            query = query.with_type(context_type);
        }

        let durable = match self.mode() {
            MeshMode::Remote => Some(self.shared.primary.query_contexts(&query).await),
            MeshMode::Local => None,
        };
        let local = self.shared.local.query_contexts(&query).await;

        let records = match (durable, local) {
            (Some(Ok(mut records)), Ok(local)) => {
                records.extend(local);
                records
            }
            (Some(Ok(records)), Err(e)) => {
                debug!(module = %module_name, error = %e, "Local history unavailable");
                records
            }
            (Some(Err(e)), Ok(local)) => {
                warn!(module = %module_name, error = %e, "Durable read failed, using local history");
                local
            }
            (None, Ok(local)) => local,
            (_, Err(e)) => {
                warn!(module = %module_name, error = %e, "Context history unavailable");
                return Vec::new();
            }
        };

        merge_context_records(records, limit)
            .into_iter()
            .map(ContextMessage::from_record)
            .collect()
    }

    /// Republish the newest `context_type` message of `from_module` as
    /// `to_module`, tagged with its origin. `None` when there is nothing to sync.
    pub async fn sync_context(
        &self,
        from_module: &str,
        to_module: &str,
        context_type: ContextType,
    ) -> Result<Option<PublishReceipt>> {
        let latest = self
            .get_context_history(from_module, Some(context_type), 1)
            .await
            .into_iter()
            .next();

        let Some(latest) = latest else {
            debug!(from = %from_module, to = %to_module, context_type = %context_type, "Nothing to sync");
            return Ok(None);
        };

        let mut data = latest.context_data;
        data.insert("synced_from".to_string(), from_module.into());
        let mut message = ContextMessage::new(to_module, context_type)
            .with_source(format!("sync:{from_module}"));
        message.context_data = data;

        self.publish(message).map(Some)
    }

    /// Drain the retry queue now instead of waiting for the next tick.
    pub async fn flush_retries(&self) -> RetryReport {
        self.shared.retry_cycle().await
    }

    /// Clear subscriptions and stop the workers. Idempotent.
    ///
    /// Messages already handed to the persistence worker are written before
    /// it exits.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Context mesh already shut down");
            return;
        }

        let removed = self.subscribers.clear();
        let (persist_tx, shutdown_tx, handles) = {
            let mut workers = self.lock_workers();
            (
                workers.persist_tx.take(),
                workers.shutdown_tx.take(),
                std::mem::take(&mut workers.handles),
            )
        };

        drop(persist_tx);
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Context mesh worker ended abnormally");
            }
        }

        info!(
            subscriptions_removed = removed,
            pending_retries = self.shared.retry.len(),
            "Context mesh shut down"
        );
    }

    pub fn mode(&self) -> MeshMode {
        self.shared.mode()
    }

    /// Messages waiting for a durable write.
    pub fn pending_retries(&self) -> usize {
        self.shared.retry.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Current time from the mesh clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_persistence(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<ContextMessage>) {
    while let Some(message) = rx.recv().await {
        shared.persist_or_queue(message).await;
    }
    debug!("Persistence worker stopped");
}

async fn run_retry(shared: Arc<Shared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.retry_cycle().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Retry worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
