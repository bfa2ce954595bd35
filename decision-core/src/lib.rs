//! Decision Core - rule evaluation and escalation for harbor operations.
//!
//! A module asks for a decision with a [`DecisionContext`]. The core evaluates
//! the module's [`DecisionRule`]s and takes one of three paths:
//!
//! ```text
//!   make_decision(ctx)
//!     ├─ no match ─────────────────────► completed / no_action
//!     ├─ one match, no escalation ─────► local execution raced against a timeout
//!     └─ otherwise ────────────────────► escalated: simulations run concurrently,
//!                                         decision pending until resolved or timed out
//! ```
//!
//! Every transition is written to the audit log and published on the
//! [`ContextMesh`](context_mesh::ContextMesh).
//!
//! ## Example
//!
//! ```rust,ignore
//! let core = DecisionCore::builder(mesh).config(config.decision).build();
//! core.register_rule(
//!     DecisionRule::new("High wind stop", "crane", RuleAction::label("stop_cranes"))
//!         .with_priority(RulePriority::Critical)
//!         .when(RuleCondition::above("wind_kn", 30.0)),
//! )?;
//! let decision = core.make_decision(DecisionContext::new("crane").with_field("wind_kn", 34)).await?;
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod rules;
pub mod simulation;
pub mod types;

pub use audit::DecisionAudit;
pub use config::{CoreConfig, DecisionConfig, StorageConfig};
pub use engine::{DecisionCore, DecisionCoreBuilder, DecisionStats};
pub use error::{DecisionError, Result};
pub use executor::{ExecutionOutcome, TerminalLatch, TimeoutExecutor};
pub use registry::RuleRegistry;
pub use rules::{ActionHandler, ConditionEvaluator, DecisionRule, RuleAction, RuleCondition, RuleSet};
pub use simulation::{HeuristicSimulator, SimulationInput, SimulationRunner, Simulator};
pub use types::{
    Decision, DecisionContext, DecisionLevel, DecisionStatus, Resolution, RulePriority, Scenario,
    SimulationResult,
};
