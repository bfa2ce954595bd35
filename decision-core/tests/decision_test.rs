//! Decision core integration tests
//!
//! Exercises the full stack (mesh + audit stores + core):
//! - Local execution, timeouts and failures
//! - Audit recovery after a store outage
//! - Escalation, simulations, watchdog and resolution
//! - Situational enrichment from mesh facts

use context_mesh::{
    ContextMesh, ContextMessage, ContextSubscription, ContextType, MeshConfig, SystemClock,
};
use decision_core::{
    ActionHandler, DecisionConfig, DecisionContext, DecisionCore, DecisionError, DecisionLevel,
    DecisionRule, DecisionStatus, HeuristicSimulator, Resolution, RuleAction, RuleCondition,
    RulePriority, Scenario, SimulationInput, SimulationResult, Simulator,
};
use mesh_store::{DecisionQuery, DurableStore, MemoryStore};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

struct Stack {
    mesh: Arc<ContextMesh>,
    core: DecisionCore,
    audit: Arc<MemoryStore>,
}

async fn stack(config: DecisionConfig) -> Stack {
    let mesh = Arc::new(ContextMesh::new(
        MeshConfig {
            retry_interval_ms: 50,
            ..MeshConfig::default()
        },
        Arc::new(MemoryStore::new("primary")),
        Arc::new(MemoryStore::new("local")),
        Arc::new(SystemClock),
    ));
    mesh.initialize().await.unwrap();

    let audit = Arc::new(MemoryStore::new("audit"));
    let core = DecisionCore::builder(Arc::clone(&mesh))
        .config(config)
        .audit_stores(
            Arc::clone(&audit) as Arc<dyn DurableStore>,
            Arc::new(MemoryStore::new("audit-local")),
        )
        .build();

    Stack { mesh, core, audit }
}

struct Sleepy {
    delay: Duration,
    label: &'static str,
}

#[async_trait::async_trait]
impl ActionHandler for Sleepy {
    async fn act(&self, _context: &DecisionContext) -> decision_core::Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok(self.label.to_string())
    }

    fn label(&self) -> &str {
        self.label
    }
}

struct Failing;

#[async_trait::async_trait]
impl ActionHandler for Failing {
    async fn act(&self, _context: &DecisionContext) -> decision_core::Result<String> {
        Err(DecisionError::Action("ballast pump did not respond".to_string()))
    }
}

/// Takes the audit store offline while it runs.
struct AuditOutage(Arc<MemoryStore>);

#[async_trait::async_trait]
impl ActionHandler for AuditOutage {
    async fn act(&self, _context: &DecisionContext) -> decision_core::Result<String> {
        self.0.set_available(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok("restart".to_string())
    }
}

/// Fails one scenario, delegates the rest.
struct OneBadScenario(Scenario);

#[async_trait::async_trait]
impl Simulator for OneBadScenario {
    async fn simulate(
        &self,
        scenario: Scenario,
        input: &SimulationInput,
    ) -> decision_core::Result<SimulationResult> {
        if scenario == self.0 {
            return Err(DecisionError::Simulation("tide model unavailable".to_string()));
        }
        HeuristicSimulator.simulate(scenario, input).await
    }
}

fn capture_events(mesh: &ContextMesh) -> Arc<Mutex<Vec<(String, String)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    mesh.subscribe(ContextSubscription::from_fn(
        "observer",
        [ContextType::Ai],
        move |message: &ContextMessage| {
            let field = |key: &str| {
                message
                    .field(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            sink.lock().unwrap().push((field("event"), field("status")));
            Ok(())
        },
    ))
    .unwrap();
    events
}

// =============================================================================
// Local path
// =============================================================================

#[tokio::test]
async fn test_no_matching_rule_is_no_action() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(
            DecisionRule::new("Never fires", "berth", RuleAction::label("alert"))
                .when(RuleCondition::Never),
        )
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("berth"))
        .await
        .unwrap();

    assert_eq!(decision.decision_level, DecisionLevel::Local);
    assert_eq!(decision.action, "no_action");
    assert_eq!(decision.status, DecisionStatus::Completed);
    assert!(!decision.executed);
    assert!(decision.matched_rules.is_empty());

    let history = stack.core.get_decision_history(Some("berth"), 10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "completed");
}

#[tokio::test]
async fn test_single_rule_executes_locally() {
    let stack = stack(DecisionConfig::default()).await;
    let events = capture_events(&stack.mesh);
    stack
        .core
        .register_rule(
            DecisionRule::new("Restart on overheat", "engine", RuleAction::label("restart"))
                .with_priority(RulePriority::High)
                .when(RuleCondition::above("coolant_c", 95.0)),
        )
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("engine").with_field("coolant_c", 104))
        .await
        .unwrap();

    assert_eq!(decision.status, DecisionStatus::Completed);
    assert_eq!(decision.action, "restart");
    assert_eq!(decision.success, Some(true));
    assert!(decision.executed);
    assert!(decision.executed_at.is_some());
    assert_eq!(decision.timeout_ms, 5_000);
    assert!(decision.simulation_results.is_none());

    let statuses: Vec<_> = events.lock().unwrap().iter().map(|(_, s)| s.clone()).collect();
    assert_eq!(statuses, vec!["executing", "completed"]);
}

#[tokio::test]
async fn test_engine_timeout_beats_slow_action() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(
            DecisionRule::new(
                "Restart engine",
                "engine",
                RuleAction::custom(Sleepy {
                    delay: Duration::from_millis(200),
                    label: "restart",
                }),
            )
            .with_timeout_ms(50),
        )
        .unwrap();

    let start = Instant::now();
    let decision = stack
        .core
        .make_decision(DecisionContext::new("engine"))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(decision.status, DecisionStatus::Timeout);
    assert_eq!(decision.success, Some(false));
    assert!(elapsed < Duration::from_millis(100), "took {elapsed:?}");

    // The late completion must not reach the audit log.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let history = stack.core.get_decision_history(Some("engine"), 10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision_id, decision.id);
    assert_eq!(history[0].status, "timeout");
    assert_eq!(stack.core.stats().timed_out, 1);
    assert_eq!(stack.core.stats().completed, 0);
}

#[tokio::test]
async fn test_settled_state_recorded_after_audit_outage() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(DecisionRule::new(
            "Restart engine",
            "engine",
            RuleAction::custom(AuditOutage(Arc::clone(&stack.audit))),
        ))
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("engine"))
        .await
        .unwrap();
    assert_eq!(decision.status, DecisionStatus::Completed);

    stack.audit.set_available(true);
    let history = stack.core.get_decision_history(Some("engine"), 10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "completed");

    let stored = stack.audit.query_decisions(&DecisionQuery::all(10)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, "completed");
    stack.core.shutdown();
}

#[tokio::test]
async fn test_audit_replays_without_reads() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(DecisionRule::new(
            "Restart engine",
            "engine",
            RuleAction::custom(AuditOutage(Arc::clone(&stack.audit))),
        ))
        .unwrap();

    stack
        .core
        .make_decision(DecisionContext::new("engine"))
        .await
        .unwrap();
    stack.audit.set_available(true);

    // Mesh retry interval is 50ms; the audit replays on the same cadence.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let stored = stack.audit.query_decisions(&DecisionQuery::all(10)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, "completed");
    stack.core.shutdown();
}

#[tokio::test]
async fn test_action_error_fails_decision() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(DecisionRule::new("Pump ballast", "stability", RuleAction::custom(Failing)))
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("stability"))
        .await
        .unwrap();

    assert_eq!(decision.status, DecisionStatus::Failed);
    assert_eq!(decision.success, Some(false));
    assert!(decision
        .error_message
        .as_deref()
        .unwrap()
        .contains("ballast pump did not respond"));
}

#[tokio::test]
async fn test_condition_fault_is_no_match() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(
            DecisionRule::new("Bad sensor rule", "crane", RuleAction::label("stop"))
                .with_priority(RulePriority::Critical)
                .when(RuleCondition::above("wind_kn", 30.0)),
        )
        .unwrap();
    stack
        .core
        .register_rule(DecisionRule::new("Routine check", "crane", RuleAction::label("inspect")))
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("crane").with_field("wind_kn", "sensor offline"))
        .await
        .unwrap();

    assert_eq!(decision.decision_level, DecisionLevel::Local);
    assert_eq!(decision.matched_rules, vec!["Routine check".to_string()]);
    assert_eq!(decision.action, "inspect");
}

#[tokio::test]
async fn test_empty_module_rejected() {
    let stack = stack(DecisionConfig::default()).await;
    let err = stack
        .core
        .make_decision(DecisionContext::new(""))
        .await
        .unwrap_err();
    assert!(matches!(err, DecisionError::InvalidContext(_)));
}

// =============================================================================
// Escalation
// =============================================================================

#[tokio::test]
async fn test_multiple_critical_matches_escalate() {
    let stack = stack(DecisionConfig::default()).await;
    let events = capture_events(&stack.mesh);

    for (name, priority) in [
        ("Traffic density", RulePriority::High),
        ("Collision course", RulePriority::Critical),
        ("Restricted visibility", RulePriority::Critical),
    ] {
        stack
            .core
            .register_rule(DecisionRule::new(name, "navigation", RuleAction::label("hold_position")).with_priority(priority))
            .unwrap();
    }

    let decision = stack
        .core
        .make_decision(DecisionContext::new("navigation"))
        .await
        .unwrap();

    assert_eq!(decision.decision_level, DecisionLevel::Escalated);
    assert_eq!(decision.status, DecisionStatus::Pending);
    assert!(!decision.executed);
    assert_eq!(decision.priority, RulePriority::Critical);
    assert_eq!(decision.timeout_ms, 30_000);
    assert_eq!(
        decision.matched_rules,
        vec!["Collision course", "Restricted visibility", "Traffic density"]
    );
    assert!(decision
        .escalation_reason
        .as_deref()
        .unwrap()
        .starts_with("3 rules matched"));
    assert_eq!(decision.simulation_results.as_ref().unwrap().len(), 5);
    assert_eq!(stack.core.pending_escalations(), vec![decision.id.clone()]);

    let events = events.lock().unwrap().clone();
    assert_eq!(events, vec![("escalation".to_string(), "pending".to_string())]);

    let history = stack.core.get_decision_history(Some("navigation"), 10).await;
    assert_eq!(history[0].decision_level, "escalated");
    assert!(history[0].simulation_results.is_some());
    stack.core.shutdown();
}

#[tokio::test]
async fn test_sole_rule_requiring_escalation() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(
            DecisionRule::new("Hazmat berth change", "berth", RuleAction::label("reassign_berth"))
                .escalate(),
        )
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("berth"))
        .await
        .unwrap();

    assert!(decision.is_escalated());
    assert_eq!(
        decision.escalation_reason.as_deref(),
        Some("rule 'Hazmat berth change' requires escalation")
    );
    stack.core.shutdown();
}

#[tokio::test]
async fn test_resolve_escalation() {
    let stack = stack(DecisionConfig::default()).await;
    stack
        .core
        .register_rule(DecisionRule::new("Storm plan", "ops", RuleAction::label("secure_cranes")).escalate())
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("ops"))
        .await
        .unwrap();

    let resolved = stack
        .core
        .resolve_escalation(
            &decision.id,
            Resolution::Completed {
                action: Some("close_port".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, DecisionStatus::Completed);
    assert_eq!(resolved.action, "close_port");
    assert!(stack.core.pending_escalations().is_empty());

    let again = stack
        .core
        .resolve_escalation(&decision.id, Resolution::Failed { error: "late".into() })
        .await;
    assert!(matches!(again, Err(DecisionError::AlreadyTerminal(_))));

    let unknown = stack
        .core
        .resolve_escalation("no-such-decision", Resolution::Completed { action: None })
        .await;
    assert!(matches!(unknown, Err(DecisionError::UnknownDecision(_))));

    let history = stack.core.get_decision_history(Some("ops"), 10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "completed");
}

#[tokio::test]
async fn test_unresolved_escalation_times_out() {
    let stack = stack(DecisionConfig {
        escalated_timeout_ms: 60,
        ..DecisionConfig::default()
    })
    .await;
    stack
        .core
        .register_rule(DecisionRule::new("Pilot request", "pilotage", RuleAction::label("assign_pilot")).escalate())
        .unwrap();

    let decision = stack
        .core
        .make_decision(DecisionContext::new("pilotage"))
        .await
        .unwrap();
    assert_eq!(decision.status, DecisionStatus::Pending);

    tokio::time::sleep(Duration::from_millis(250)).await;

    let history = stack.core.get_decision_history(Some("pilotage"), 10).await;
    assert_eq!(history[0].status, "timeout");
    assert!(!history[0].executed);
    assert!(stack.core.pending_escalations().is_empty());

    let late = stack
        .core
        .resolve_escalation(&decision.id, Resolution::Completed { action: None })
        .await;
    assert!(matches!(late, Err(DecisionError::AlreadyTerminal(_))));
    assert_eq!(stack.audit.write_count(), 2);
}

#[tokio::test]
async fn test_failed_simulation_is_dropped() {
    let mesh = Arc::new(ContextMesh::new(
        MeshConfig::default(),
        Arc::new(MemoryStore::new("primary")),
        Arc::new(MemoryStore::new("local")),
        Arc::new(SystemClock),
    ));
    let core = DecisionCore::builder(mesh)
        .simulator(Arc::new(OneBadScenario(Scenario::HighRisk)))
        .build();

    let results = core
        .run_simulations(DecisionContext::new("pilotage"))
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.scenario != Scenario::HighRisk));
    assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.confidence)));
}

// =============================================================================
// Situational enrichment and rule management
// =============================================================================

#[tokio::test]
async fn test_mesh_facts_feed_conditions() {
    let stack = stack(DecisionConfig::default()).await;
    assert_ok!(stack.core.attach());
    assert_ok!(stack.core.attach());

    stack
        .core
        .register_rule(
            DecisionRule::new("Risk gate", "navigation", RuleAction::label("slow_ahead"))
                .when(RuleCondition::above("mesh.risk.level", 5.0)),
        )
        .unwrap();

    let before = stack
        .core
        .make_decision(DecisionContext::new("navigation"))
        .await
        .unwrap();
    assert_eq!(before.action, "no_action");

    stack
        .mesh
        .publish(ContextMessage::new("navigation", ContextType::Risk).with_field("level", 9))
        .unwrap();

    let after = stack
        .core
        .make_decision(DecisionContext::new("navigation"))
        .await
        .unwrap();
    assert_eq!(after.action, "slow_ahead");
    assert!(after.context.situational.contains_key(&ContextType::Risk));

    assert!(stack.core.detach());
    assert!(!stack.core.detach());
}

#[tokio::test]
async fn test_rules_from_yaml_and_unregister() {
    let stack = stack(DecisionConfig::default()).await;
    let loaded = stack
        .core
        .load_rules_yaml(
            r#"
rules:
  - id: gate-congestion
    name: Gate congestion
    module_name: gate
    priority: high
    condition:
      kind: above
      field: queue_len
      threshold: 40
    action:
      kind: label
      action: open_overflow_lane
"#,
        )
        .unwrap();
    assert_eq!(loaded, 1);

    let decision = stack
        .core
        .make_decision(DecisionContext::new("gate").with_field("queue_len", 55))
        .await
        .unwrap();
    assert_eq!(decision.action, "open_overflow_lane");
    assert_eq!(decision.priority, RulePriority::High);

    assert!(stack.core.unregister_rule("gate-congestion"));
    let decision = stack
        .core
        .make_decision(DecisionContext::new("gate").with_field("queue_len", 55))
        .await
        .unwrap();
    assert_eq!(decision.action, "no_action");

    let stats = stack.core.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 2);
}
