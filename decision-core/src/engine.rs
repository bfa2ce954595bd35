//! The distributed decision core.

use crate::audit::DecisionAudit;
use crate::config::DecisionConfig;
use crate::error::{DecisionError, Result};
use crate::executor::{ExecutionOutcome, TerminalLatch, TimeoutExecutor};
use crate::registry::RuleRegistry;
use crate::rules::DecisionRule;
use crate::simulation::{HeuristicSimulator, SimulationInput, SimulationRunner, Simulator};
use crate::types::{
    Decision, DecisionContext, DecisionLevel, DecisionStatus, Resolution, SimulationResult,
};
use context_mesh::{
    Clock, ContextMesh, ContextMessage, ContextSubscription, ContextType, SubscriptionId,
    SystemClock,
};
use dashmap::DashMap;
use futures::FutureExt;
use mesh_store::{DecisionQuery, DecisionRecord, DurableStore, MemoryStore};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SUBSCRIBER_NAME: &str = "decision-core";

/// Decision counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionStats {
    pub total: usize,
    pub escalated: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    escalated: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
}

impl Counters {
    fn settled(&self, status: DecisionStatus) {
        let counter = match status {
            DecisionStatus::Completed => &self.completed,
            DecisionStatus::Failed => &self.failed,
            DecisionStatus::Timeout => &self.timed_out,
            DecisionStatus::Pending | DecisionStatus::Executing => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DecisionStats {
        DecisionStats {
            total: self.total.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// An escalated decision awaiting resolution.
struct PendingEscalation {
    decision: Decision,
    latch: Arc<TerminalLatch>,
    watchdog: Option<JoinHandle<()>>,
}

/// State reachable from escalation watchdogs.
struct Shared {
    mesh: Arc<ContextMesh>,
    audit: DecisionAudit,
    clock: Arc<dyn Clock>,
    pending: DashMap<String, PendingEscalation>,
    decision_context_type: ContextType,
    counters: Counters,
}

impl Shared {
    /// Apply a terminal outcome, then log, audit and publish it.
    async fn finish(&self, mut decision: Decision, outcome: &ExecutionOutcome) -> Decision {
        decision.status = outcome.status;
        decision.executed = outcome.executed;
        decision.success = Some(outcome.success());
        decision.error_message = outcome.error_message.clone();
        decision.executed_at = outcome.executed.then_some(outcome.finished_at);
        if let Some(action) = &outcome.action {
            decision.action = action.clone();
        }

        log_settled(&decision);
        self.counters.settled(decision.status);
        self.audit.record(&decision).await;
        self.publish(&decision, "decision");
        decision
    }

    fn publish(&self, decision: &Decision, event: &str) {
        let mut message = ContextMessage::new(&decision.module_name, self.decision_context_type)
            .with_source(SUBSCRIBER_NAME)
            .with_field("event", event)
            .with_field("decision_id", decision.id.clone())
            .with_field("decision_level", decision.decision_level.as_str())
            .with_field("status", decision.status.as_str())
            .with_field("action", decision.action.clone())
            .with_field("priority", decision.priority.as_str())
            .with_field("matched_rules", decision.matched_rules.clone());
        if let Some(reason) = &decision.escalation_reason {
            message = message.with_field("escalation_reason", reason.clone());
        }
        if let Some(results) = &decision.simulation_results {
            message = message.with_field("simulations", results.len());
        }

        if let Err(e) = self.mesh.publish(message) {
            warn!(decision_id = %decision.id, error = %e, "Failed to publish decision on the mesh");
        }
    }
}

fn log_settled(decision: &Decision) {
    let rule = decision.matched_rules.first().map(String::as_str).unwrap_or("none");
    match decision.status {
        DecisionStatus::Completed => info!(
            module = %decision.module_name,
            decision_id = %decision.id,
            level = %decision.decision_level,
            rule = %rule,
            action = %decision.action,
            escalation_reason = ?decision.escalation_reason,
            "Decision completed"
        ),
        DecisionStatus::Failed => warn!(
            module = %decision.module_name,
            decision_id = %decision.id,
            level = %decision.decision_level,
            rule = %rule,
            error = ?decision.error_message,
            escalation_reason = ?decision.escalation_reason,
            "Decision failed"
        ),
        DecisionStatus::Timeout => warn!(
            module = %decision.module_name,
            decision_id = %decision.id,
            level = %decision.decision_level,
            rule = %rule,
            timeout_ms = decision.timeout_ms,
            escalation_reason = ?decision.escalation_reason,
            "Decision timed out"
        ),
        DecisionStatus::Pending | DecisionStatus::Executing => {}
    }
}

fn escalation_reason(matched: &[Arc<DecisionRule>]) -> String {
    match matched {
        [rule] => format!("rule '{}' requires escalation", rule.name),
        rules => {
            let names: Vec<_> = rules
                .iter()
                .map(|r| format!("{} ({})", r.name, r.priority))
                .collect();
            format!("{} rules matched: {}", rules.len(), names.join(", "))
        }
    }
}

/// Evaluates rules for a module and either executes locally under a timeout
/// or escalates with concurrent simulations.
///
/// Every decision is audited and published on the mesh with its status.
pub struct DecisionCore {
    config: DecisionConfig,
    registry: RuleRegistry,
    runner: SimulationRunner,
    executor: TimeoutExecutor,
    shared: Arc<Shared>,
    /// Latest mesh fact per (module, context type)
    facts: Arc<DashMap<(String, ContextType), Map<String, Value>>>,
    observer: Mutex<Option<SubscriptionId>>,
}

impl DecisionCore {
    pub fn new(
        config: DecisionConfig,
        mesh: Arc<ContextMesh>,
        primary: Arc<dyn DurableStore>,
        local: Arc<dyn DurableStore>,
        simulator: Arc<dyn Simulator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let runner = SimulationRunner::new(
            simulator,
            config.scenarios.clone(),
            config.simulation_timeout(),
        );
        let executor = TimeoutExecutor::new(Arc::clone(&clock), config.cancel_on_timeout);
        let audit =
            DecisionAudit::new(primary, local).with_retry_interval(mesh.config().retry_interval());
        let shared = Arc::new(Shared {
            mesh,
            audit,
            clock,
            pending: DashMap::new(),
            decision_context_type: config.decision_context_type,
            counters: Counters::default(),
        });

        Self {
            config,
            registry: RuleRegistry::new(),
            runner,
            executor,
            shared,
            facts: Arc::new(DashMap::new()),
            observer: Mutex::new(None),
        }
    }

    /// Create a builder.
    pub fn builder(mesh: Arc<ContextMesh>) -> DecisionCoreBuilder {
        DecisionCoreBuilder::new(mesh)
    }

    pub fn register_rule(&self, rule: DecisionRule) -> Result<()> {
        self.registry.register(rule)
    }

    pub fn unregister_rule(&self, rule_id: &str) -> bool {
        self.registry.unregister(rule_id)
    }

    /// Register rules from a YAML rule set.
    pub fn load_rules_yaml(&self, yaml: &str) -> Result<usize> {
        self.registry.load_yaml(yaml)
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Subscribe to the observed context types so decisions see the latest
    /// situational facts. Calling it again returns the existing subscription.
    pub fn attach(&self) -> Result<SubscriptionId> {
        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = observer.as_ref() {
            return Ok(id.clone());
        }

        let facts = Arc::clone(&self.facts);
        let id = self.shared.mesh.subscribe(ContextSubscription::from_fn(
            SUBSCRIBER_NAME,
            self.config.observed_context_types.clone(),
            move |message: &ContextMessage| {
                facts.insert(
                    (message.module_name.clone(), message.context_type),
                    message.context_data.clone(),
                );
                Ok(())
            },
        ))?;

        info!(subscription_id = %id, "Decision core attached to context mesh");
        *observer = Some(id.clone());
        Ok(id)
    }

    /// Drop the mesh subscription. Returns `false` if not attached.
    pub fn detach(&self) -> bool {
        let id = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match id {
            Some(id) => self.shared.mesh.unsubscribe(&id),
            None => false,
        }
    }

    /// Decide for `context.module_name`.
    ///
    /// - no matching rule: completed `no_action`, nothing executed
    /// - one match without escalation: executed locally under a timeout
    /// - otherwise: escalated and left pending until resolved or timed out
    pub async fn make_decision(&self, context: DecisionContext) -> Result<Decision> {
        if context.module_name.trim().is_empty() {
            return Err(DecisionError::InvalidContext(
                "module_name must not be empty".to_string(),
            ));
        }

        let now = self.shared.clock.now();
        let mut context = context;
        context.timestamp.get_or_insert(now);
        self.enrich(&mut context);
        self.shared.counters.total.fetch_add(1, Ordering::Relaxed);

        let matched = self.matching_rules(&context).await;
        let mut decision = Decision::new(context, now);

        let Some(top) = matched.first() else {
            let outcome = ExecutionOutcome {
                status: DecisionStatus::Completed,
                executed: false,
                action: None,
                error_message: None,
                finished_at: now,
            };
            return Ok(self.shared.finish(decision, &outcome).await);
        };

        decision.priority = top.priority;
        decision.action = top.action.describe().to_string();
        decision.matched_rules = matched.iter().map(|r| r.name.clone()).collect();

        if matched.len() == 1 && !top.requires_escalation {
            return Ok(self.execute_local(decision, top).await);
        }
        Ok(self.escalate(decision, &matched).await)
    }

    fn enrich(&self, context: &mut DecisionContext) {
        for context_type in &self.config.observed_context_types {
            if context.situational.contains_key(context_type) {
                continue;
            }
            let key = (context.module_name.clone(), *context_type);
            if let Some(fact) = self.facts.get(&key) {
                context.situational.insert(*context_type, fact.value().clone());
            }
        }
    }

    /// Matching rules, highest priority first, registration order within a
    /// priority. Faulting conditions count as no match.
    async fn matching_rules(&self, context: &DecisionContext) -> Vec<Arc<DecisionRule>> {
        let mut matched = Vec::new();
        for rule in self.registry.rules_for(&context.module_name) {
            let evaluated = AssertUnwindSafe(rule.condition.evaluate(context))
                .catch_unwind()
                .await;
            match evaluated {
                Ok(Ok(true)) => {
                    debug!(rule_id = %rule.id, rule_name = %rule.name, "Rule matched");
                    matched.push(rule);
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(
                    module = %context.module_name,
                    rule = %rule.name,
                    error = %e,
                    "Rule condition failed, treating as no match"
                ),
                Err(_) => warn!(
                    module = %context.module_name,
                    rule = %rule.name,
                    "Rule condition panicked, treating as no match"
                ),
            }
        }
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }

    async fn execute_local(&self, mut decision: Decision, rule: &DecisionRule) -> Decision {
        let timeout = rule
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.local_timeout());
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        decision.decision_level = DecisionLevel::Local;
        decision.status = DecisionStatus::Executing;
        decision.timeout_ms = timeout_ms;

        debug!(
            module = %decision.module_name,
            decision_id = %decision.id,
            rule = %rule.name,
            timeout_ms,
            "Executing decision locally"
        );
        self.shared.audit.record(&decision).await;
        self.shared.publish(&decision, "decision");

        let outcome = self
            .executor
            .execute(
                &decision.id,
                rule.action.clone(),
                decision.context.clone(),
                timeout,
            )
            .await;
        self.shared.finish(decision, &outcome).await
    }

    async fn escalate(&self, mut decision: Decision, matched: &[Arc<DecisionRule>]) -> Decision {
        let reason = escalation_reason(matched);
        let input = SimulationInput {
            context: decision.context.clone(),
            matched_rules: matched.len(),
            top_priority: Some(decision.priority),
        };
        let simulations = match self.runner.run(input).await {
            Ok(results) => results,
            Err(e) => {
                warn!(decision_id = %decision.id, error = %e, "Simulations unavailable");
                Vec::new()
            }
        };

        decision.decision_level = DecisionLevel::Escalated;
        decision.status = DecisionStatus::Pending;
        decision.timeout_ms = self.config.escalated_timeout_ms;
        decision.simulation_results = Some(simulations);
        decision.escalation_reason = Some(reason);

        info!(
            module = %decision.module_name,
            decision_id = %decision.id,
            escalation_reason = ?decision.escalation_reason,
            matched = matched.len(),
            simulations = decision.simulation_results.as_ref().map_or(0, Vec::len),
            timeout_ms = decision.timeout_ms,
            "Decision escalated"
        );
        self.shared.counters.escalated.fetch_add(1, Ordering::Relaxed);
        self.shared.audit.record(&decision).await;
        self.arm_watchdog(&decision);
        self.shared.publish(&decision, "escalation");
        decision
    }

    /// Track the escalation and time it out if nobody resolves it.
    fn arm_watchdog(&self, decision: &Decision) {
        let latch = Arc::new(TerminalLatch::new());
        self.shared.pending.insert(
            decision.id.clone(),
            PendingEscalation {
                decision: decision.clone(),
                latch: Arc::clone(&latch),
                watchdog: None,
            },
        );

        let shared = Arc::clone(&self.shared);
        let decision_id = decision.id.clone();
        let timeout = self.config.escalated_timeout();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let outcome = ExecutionOutcome::timed_out(timeout, false, shared.clock.now());
            if !latch.settle(outcome.clone()) {
                return;
            }
            if let Some((_, entry)) = shared.pending.remove(&decision_id) {
                shared.finish(entry.decision, &outcome).await;
            }
        });

        if let Some(mut entry) = self.shared.pending.get_mut(&decision.id) {
            entry.watchdog = Some(watchdog);
        }
    }

    /// Close a pending escalated decision.
    pub async fn resolve_escalation(
        &self,
        decision_id: &str,
        resolution: Resolution,
    ) -> Result<Decision> {
        let latch = self
            .shared
            .pending
            .get(decision_id)
            .map(|entry| Arc::clone(&entry.latch));
        let Some(latch) = latch else {
            return Err(if self.shared.audit.contains(decision_id).await {
                DecisionError::AlreadyTerminal(decision_id.to_string())
            } else {
                DecisionError::UnknownDecision(decision_id.to_string())
            });
        };

        let now = self.shared.clock.now();
        let outcome = match resolution {
            Resolution::Completed { action } => ExecutionOutcome::completed(action, now),
            Resolution::Failed { error } => ExecutionOutcome::failed(error, now),
        };
        if !latch.settle(outcome.clone()) {
            return Err(DecisionError::AlreadyTerminal(decision_id.to_string()));
        }

        let Some((_, entry)) = self.shared.pending.remove(decision_id) else {
            return Err(DecisionError::AlreadyTerminal(decision_id.to_string()));
        };
        if let Some(watchdog) = entry.watchdog {
            watchdog.abort();
        }
        Ok(self.shared.finish(entry.decision, &outcome).await)
    }

    /// Run the scenario menu for a context without making a decision.
    pub async fn run_simulations(&self, context: DecisionContext) -> Result<Vec<SimulationResult>> {
        let mut context = context;
        self.enrich(&mut context);
        let matched = self.matching_rules(&context).await;
        let input = SimulationInput {
            matched_rules: matched.len(),
            top_priority: matched.first().map(|r| r.priority),
            context,
        };
        self.runner.run(input).await
    }

    /// Audited decisions, newest first.
    pub async fn get_decision_history(
        &self,
        module_name: Option<&str>,
        limit: usize,
    ) -> Vec<DecisionRecord> {
        let query = match module_name {
            Some(module) => DecisionQuery::for_module(module, limit),
            None => DecisionQuery::all(limit),
        };
        self.shared.audit.history(&query).await
    }

    /// Ids of escalated decisions awaiting resolution.
    pub fn pending_escalations(&self) -> Vec<String> {
        self.shared
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn stats(&self) -> DecisionStats {
        self.shared.counters.snapshot()
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Detach from the mesh, stop escalation watchdogs and the audit replay
    /// worker. Pending decisions stay pending in the audit log.
    pub fn shutdown(&self) {
        self.detach();
        self.shared.audit.shutdown();
        let mut stopped = 0;
        for mut entry in self.shared.pending.iter_mut() {
            if let Some(watchdog) = entry.watchdog.take() {
                watchdog.abort();
                stopped += 1;
            }
        }
        info!(watchdogs_stopped = stopped, "Decision core shut down");
    }
}

/// Builder for [`DecisionCore`].
pub struct DecisionCoreBuilder {
    mesh: Arc<ContextMesh>,
    config: DecisionConfig,
    primary: Option<Arc<dyn DurableStore>>,
    local: Option<Arc<dyn DurableStore>>,
    simulator: Option<Arc<dyn Simulator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DecisionCoreBuilder {
    pub fn new(mesh: Arc<ContextMesh>) -> Self {
        Self {
            mesh,
            config: DecisionConfig::default(),
            primary: None,
            local: None,
            simulator: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: DecisionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the audit stores. Defaults to in-memory stores.
    pub fn audit_stores(mut self, primary: Arc<dyn DurableStore>, local: Arc<dyn DurableStore>) -> Self {
        self.primary = Some(primary);
        self.local = Some(local);
        self
    }

    /// Set the simulator. Defaults to [`HeuristicSimulator`].
    pub fn simulator(mut self, simulator: Arc<dyn Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    /// Set the clock. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> DecisionCore {
        let primary = self
            .primary
            .unwrap_or_else(|| Arc::new(MemoryStore::new("audit")) as Arc<dyn DurableStore>);
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MemoryStore::new("audit-local")) as Arc<dyn DurableStore>);
        let simulator = self
            .simulator
            .unwrap_or_else(|| Arc::new(HeuristicSimulator) as Arc<dyn Simulator>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        DecisionCore::new(self.config, self.mesh, primary, local, simulator, clock)
    }
}
