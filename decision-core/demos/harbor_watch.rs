//! Harbor watch: a small end-to-end run of the mesh and decision core.
//!
//! ```text
//! RUST_LOG=debug cargo run -p decision-core --example harbor_watch
//! ```

use context_mesh::{ContextMesh, ContextMessage, ContextSubscription, ContextType, SystemClock};
use decision_core::{
    CoreConfig, DecisionContext, DecisionCore, DecisionRule, Resolution, RuleAction,
    RuleCondition, RulePriority,
};
use mesh_store::MemoryStore;
use std::sync::Arc;
use tracing::info;

const CONFIG: &str = r#"
mesh:
  retry_interval_ms: 1000
decision:
  local_timeout_ms: 2000
  escalated_timeout_ms: 10000
  observed_context_types: [risk, mission]
storage:
  ephemeral_capacity: 256
"#;

const RULES: &str = r#"
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
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("decision_core=info".parse()?)
                .add_directive("context_mesh=info".parse()?),
        )
        .init();

    let config = CoreConfig::from_yaml(CONFIG)?;
    let local = config.storage.open_local()?;
    let mesh = Arc::new(ContextMesh::new(
        config.mesh.clone(),
        Arc::new(MemoryStore::new("harbor-primary")),
        local,
        Arc::new(SystemClock),
    ));
    mesh.initialize().await?;

    mesh.subscribe(ContextSubscription::from_fn(
        "bridge-display",
        [ContextType::Ai],
        |message: &ContextMessage| {
            info!(
                module = %message.module_name,
                event = ?message.field("event"),
                status = ?message.field("status"),
                "Bridge display update"
            );
            Ok(())
        },
    ))?;

    let core = DecisionCore::builder(Arc::clone(&mesh))
        .config(config.decision.clone())
        .build();
    core.attach()?;

    core.load_rules_yaml(RULES)?;
    core.register_rule(
        DecisionRule::new("Collision course", "navigation", RuleAction::label("hold_position"))
            .with_priority(RulePriority::Critical)
            .when(RuleCondition::above("mesh.risk.level", 7.0)),
    )?;
    core.register_rule(
        DecisionRule::new("Restricted visibility", "navigation", RuleAction::label("sound_signals"))
            .with_priority(RulePriority::Critical)
            .when(RuleCondition::below("visibility_nm", 1.0)),
    )?;

    let gate = core
        .make_decision(DecisionContext::new("gate").with_field("queue_len", 52))
        .await?;
    info!(decision_id = %gate.id, status = %gate.status, action = %gate.action, "Gate decision");

    mesh.publish(ContextMessage::new("navigation", ContextType::Risk).with_field("level", 9))?;
    let navigation = core
        .make_decision(
            DecisionContext::new("navigation")
                .with_field("visibility_nm", 0.4)
                .requested_by("harbor-master"),
        )
        .await?;
    info!(
        decision_id = %navigation.id,
        level = %navigation.decision_level,
        reason = ?navigation.escalation_reason,
        "Navigation decision"
    );
    if let Some(results) = &navigation.simulation_results {
        for result in results {
            info!(scenario = %result.scenario, confidence = result.confidence, outcome = %result.outcome, "Simulation");
        }
    }

    let resolved = core
        .resolve_escalation(
            &navigation.id,
            Resolution::Completed {
                action: Some("hold_position".to_string()),
            },
        )
        .await?;
    info!(decision_id = %resolved.id, status = %resolved.status, "Escalation resolved");

    for record in core.get_decision_history(None, 10).await {
        info!(
            module = %record.module_name,
            level = %record.decision_level,
            status = %record.status,
            action = %record.action,
            "History"
        );
    }
    info!(stats = ?core.stats(), "Decision stats");

    core.shutdown();
    mesh.shutdown().await;
    Ok(())
}
