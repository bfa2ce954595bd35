//! Core types for decisions.

use chrono::{DateTime, Utc};
use mesh_store::{ContextType, DecisionRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Rule priority, used only to order multiple matches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RulePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RulePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLevel {
    /// Executed by the owning module
    Local,
    /// Routed to the collaborative path with simulations
    Escalated,
    Delegated,
    Collaborative,
}

impl DecisionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Escalated => "escalated",
            Self::Delegated => "delegated",
            Self::Collaborative => "collaborative",
        }
    }
}

impl fmt::Display for DecisionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Timeout,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    /// Terminal states never change once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What-if scenario run during escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Optimistic,
    Pessimistic,
    Balanced,
    HighRisk,
    LowRisk,
}

impl Scenario {
    /// The default scenario menu, in run order.
    pub const ALL: [Scenario; 5] = [
        Scenario::Optimistic,
        Scenario::Pessimistic,
        Scenario::Balanced,
        Scenario::HighRisk,
        Scenario::LowRisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Pessimistic => "pessimistic",
            Self::Balanced => "balanced",
            Self::HighRisk => "high_risk",
            Self::LowRisk => "low_risk",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub module_name: String,

    /// Free-text category, e.g. "operational" or "safety"
    #[serde(default = "default_decision_type")]
    pub decision_type: String,

    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub requested_by: Option<String>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Latest mesh facts for the module, filled in by the core
    #[serde(default)]
    pub situational: BTreeMap<ContextType, Map<String, Value>>,
}

fn default_decision_type() -> String {
    "operational".to_string()
}

impl DecisionContext {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            decision_type: default_decision_type(),
            data: Map::new(),
            requested_by: None,
            timestamp: None,
            situational: BTreeMap::new(),
        }
    }

    /// Replace the data. Non-object values land under `"value"`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_decision_type(mut self, decision_type: impl Into<String>) -> Self {
        self.decision_type = decision_type.into();
        self
    }

    pub fn requested_by(mut self, requester: impl Into<String>) -> Self {
        self.requested_by = Some(requester.into());
        self
    }

    pub fn with_situational(mut self, context_type: ContextType, fact: Map<String, Value>) -> Self {
        self.situational.insert(context_type, fact);
        self
    }

    /// Resolve a dotted path.
    ///
    /// `mesh.<context_type>.<path>` reads situational facts; anything else
    /// reads `data`. Array elements are addressed by index.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;

        let mut current = if first == "mesh" {
            let context_type = ContextType::from_str(segments.next()?).ok()?;
            let fact = self.situational.get(&context_type)?;
            fact.get(segments.next()?)?
        } else {
            self.data.get(first)?
        };

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// One scenario outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub scenario: Scenario,
    pub outcome: String,
    /// Always within [0, 1]
    pub confidence: f64,
    pub risks: Vec<String>,
    pub benefits: Vec<String>,
}

impl SimulationResult {
    pub fn new(scenario: Scenario, outcome: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            scenario,
            outcome: outcome.into(),
            confidence,
            risks: Vec::new(),
            benefits: Vec::new(),
        }
    }

    pub fn with_risks<I, S>(mut self, risks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.risks = risks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_benefits<I, S>(mut self, benefits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.benefits = benefits.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome supplied when closing an escalated decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    /// Carried out; optionally with a different action than proposed
    Completed { action: Option<String> },
    Failed { error: String },
}

/// The result of one `make_decision` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub module_name: String,
    pub decision_level: DecisionLevel,
    pub decision_type: String,
    /// Snapshot taken when the decision was made
    pub context: DecisionContext,
    pub action: String,
    pub priority: RulePriority,
    pub status: DecisionStatus,
    pub timeout_ms: u64,
    pub executed: bool,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    /// Names of matched rules, highest priority first
    pub matched_rules: Vec<String>,
    pub simulation_results: Option<Vec<SimulationResult>>,
    pub escalation_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub(crate) fn new(context: DecisionContext, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            module_name: context.module_name.clone(),
            decision_level: DecisionLevel::Local,
            decision_type: context.decision_type.clone(),
            context,
            action: "no_action".to_string(),
            priority: RulePriority::Low,
            status: DecisionStatus::Pending,
            timeout_ms: 0,
            executed: false,
            success: None,
            error_message: None,
            matched_rules: Vec::new(),
            simulation_results: None,
            escalation_reason: None,
            timestamp,
            executed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_escalated(&self) -> bool {
        self.decision_level == DecisionLevel::Escalated
    }

    /// Flatten into an audit record.
    pub fn to_record(&self) -> DecisionRecord {
        DecisionRecord {
            decision_id: self.id.clone(),
            module_name: self.module_name.clone(),
            decision_level: self.decision_level.as_str().to_string(),
            decision_type: self.decision_type.clone(),
            context: serde_json::to_value(&self.context).unwrap_or_default(),
            action: self.action.clone(),
            priority: self.priority.as_str().to_string(),
            status: self.status.as_str().to_string(),
            timeout_ms: self.timeout_ms,
            executed: self.executed,
            success: self.success,
            error_message: self.error_message.clone(),
            simulation_results: self
                .simulation_results
                .as_ref()
                .map(|results| serde_json::to_value(results).unwrap_or_default()),
            escalation_reason: self.escalation_reason.clone(),
            timestamp: self.timestamp,
            executed_at: self.executed_at,
        }
    }
}
