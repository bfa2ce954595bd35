//! Decision rules: data-described conditions and actions.
//!
//! Conditions and actions are tagged variants so rules can be loaded from
//! YAML. Programmatic behaviour plugs in through [`ConditionEvaluator`] and
//! [`ActionHandler`].

use crate::error::{DecisionError, Result};
use crate::types::{DecisionContext, RulePriority};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Programmatic rule condition.
#[async_trait::async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(&self, context: &DecisionContext) -> Result<bool>;
}

/// Programmatic rule action. Returns the label of the action taken.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    async fn act(&self, context: &DecisionContext) -> Result<String>;

    /// Label recorded before the action has run.
    fn label(&self) -> &str {
        "custom"
    }
}

/// Condition for rule matching.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    #[default]
    Always,
    Never,
    /// Field equals value (numbers compare by value)
    Equals { field: String, value: Value },
    /// Numeric field strictly above threshold
    Above { field: String, threshold: f64 },
    /// Numeric field strictly below threshold
    Below { field: String, threshold: f64 },
    Present { field: String },
    All { conditions: Vec<RuleCondition> },
    Any { conditions: Vec<RuleCondition> },
    Not { condition: Box<RuleCondition> },
    #[serde(skip)]
    Custom(Arc<dyn ConditionEvaluator>),
}

impl RuleCondition {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn above(field: impl Into<String>, threshold: f64) -> Self {
        Self::Above {
            field: field.into(),
            threshold,
        }
    }

    pub fn below(field: impl Into<String>, threshold: f64) -> Self {
        Self::Below {
            field: field.into(),
            threshold,
        }
    }

    pub fn present(field: impl Into<String>) -> Self {
        Self::Present {
            field: field.into(),
        }
    }

    pub fn custom(evaluator: impl ConditionEvaluator + 'static) -> Self {
        Self::Custom(Arc::new(evaluator))
    }

    /// Evaluate against a context.
    ///
    /// A missing field is a non-match. A non-numeric value under `above` or
    /// `below` is an error.
    pub fn evaluate<'a>(&'a self, context: &'a DecisionContext) -> BoxFuture<'a, Result<bool>> {
        async move {
            match self {
                RuleCondition::Always => Ok(true),
                RuleCondition::Never => Ok(false),
                RuleCondition::Equals { field, value } => Ok(context
                    .lookup(field)
                    .is_some_and(|actual| values_equal(actual, value))),
                RuleCondition::Above { field, threshold } => {
                    Ok(numeric(context, field)?.is_some_and(|v| v > *threshold))
                }
                RuleCondition::Below { field, threshold } => {
                    Ok(numeric(context, field)?.is_some_and(|v| v < *threshold))
                }
                RuleCondition::Present { field } => {
                    Ok(context.lookup(field).is_some_and(|v| !v.is_null()))
                }
                RuleCondition::All { conditions } => {
                    for condition in conditions {
                        if !condition.evaluate(context).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RuleCondition::Any { conditions } => {
                    for condition in conditions {
                        if condition.evaluate(context).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RuleCondition::Not { condition } => Ok(!condition.evaluate(context).await?),
                RuleCondition::Custom(evaluator) => evaluator.evaluate(context).await,
            }
        }
        .boxed()
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn numeric(context: &DecisionContext, field: &str) -> Result<Option<f64>> {
    match context.lookup(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| {
            DecisionError::Condition(format!("field '{field}' is not numeric: {value}"))
        }),
    }
}

impl fmt::Debug for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Never => f.write_str("Never"),
            Self::Equals { field, value } => write!(f, "Equals({field} == {value})"),
            Self::Above { field, threshold } => write!(f, "Above({field} > {threshold})"),
            Self::Below { field, threshold } => write!(f, "Below({field} < {threshold})"),
            Self::Present { field } => write!(f, "Present({field})"),
            Self::All { conditions } => f.debug_tuple("All").field(conditions).finish(),
            Self::Any { conditions } => f.debug_tuple("Any").field(conditions).finish(),
            Self::Not { condition } => f.debug_tuple("Not").field(condition).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// What a rule does when it is executed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Report a fixed action label
    Label { action: String },
    #[serde(skip)]
    Custom(Arc<dyn ActionHandler>),
}

impl RuleAction {
    pub fn label(action: impl Into<String>) -> Self {
        Self::Label {
            action: action.into(),
        }
    }

    pub fn custom(handler: impl ActionHandler + 'static) -> Self {
        Self::Custom(Arc::new(handler))
    }

    /// Label recorded on the decision before execution.
    pub fn describe(&self) -> &str {
        match self {
            Self::Label { action } => action,
            Self::Custom(handler) => handler.label(),
        }
    }

    pub async fn run(&self, context: &DecisionContext) -> Result<String> {
        match self {
            Self::Label { action } => Ok(action.clone()),
            Self::Custom(handler) => handler.act(context).await,
        }
    }
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label { action } => write!(f, "Label({action})"),
            Self::Custom(handler) => write!(f, "Custom({})", handler.label()),
        }
    }
}

/// A registered policy scoped to one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRule {
    #[serde(default = "generate_rule_id")]
    pub id: String,
    pub name: String,
    pub module_name: String,
    #[serde(default)]
    pub priority: RulePriority,
    #[serde(default)]
    pub condition: RuleCondition,
    pub action: RuleAction,
    /// Forces escalation even when this is the only match
    #[serde(default)]
    pub requires_escalation: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn generate_rule_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl DecisionRule {
    /// New rule that always matches with medium priority.
    pub fn new(name: impl Into<String>, module_name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id: generate_rule_id(),
            name: name.into(),
            module_name: module_name.into(),
            priority: RulePriority::Medium,
            condition: RuleCondition::Always,
            action,
            requires_escalation: false,
            timeout_ms: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn escalate(mut self) -> Self {
        self.requires_escalation = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DecisionError::InvalidRule("rule id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(DecisionError::InvalidRule(format!(
                "rule {} has an empty name",
                self.id
            )));
        }
        if self.module_name.trim().is_empty() {
            return Err(DecisionError::InvalidRule(format!(
                "rule '{}' has no module",
                self.name
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(DecisionError::InvalidRule(format!(
                "rule '{}' has a zero timeout",
                self.name
            )));
        }
        Ok(())
    }
}

/// A YAML document of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<DecisionRule>,
}

impl RuleSet {
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Threshold(f64);

    #[async_trait::async_trait]
    impl ConditionEvaluator for Threshold {
        async fn evaluate(&self, context: &DecisionContext) -> Result<bool> {
            Ok(context.lookup("wind_kn").and_then(Value::as_f64).unwrap_or(0.0) >= self.0)
        }
    }

    fn context() -> DecisionContext {
        DecisionContext::new("crane")
            .with_field("wind_kn", 31)
            .with_field("status", "loading")
            .with_field("reading", "n/a")
    }

    #[tokio::test]
    async fn test_composite_conditions() {
        let ctx = context();
        let cond = RuleCondition::All {
            conditions: vec![
                RuleCondition::above("wind_kn", 30.0),
                RuleCondition::equals("status", "loading"),
                RuleCondition::Not {
                    condition: Box::new(RuleCondition::present("lockout")),
                },
            ],
        };
        assert!(cond.evaluate(&ctx).await.unwrap());

        let any = RuleCondition::Any {
            conditions: vec![RuleCondition::Never, RuleCondition::below("wind_kn", 10.0)],
        };
        assert!(!any.evaluate(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_numeric_equality_ignores_representation() {
        let ctx = context();
        assert!(RuleCondition::equals("wind_kn", 31.0).evaluate(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_field_is_no_match() {
        let ctx = context();
        assert!(!RuleCondition::above("gust_kn", 40.0).evaluate(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_numeric_comparison_is_error() {
        let ctx = context();
        let err = RuleCondition::above("reading", 1.0).evaluate(&ctx).await.unwrap_err();
        assert!(matches!(err, DecisionError::Condition(_)));
    }

    #[tokio::test]
    async fn test_custom_condition() {
        let ctx = context();
        assert!(RuleCondition::custom(Threshold(25.0)).evaluate(&ctx).await.unwrap());
        assert!(!RuleCondition::custom(Threshold(35.0)).evaluate(&ctx).await.unwrap());
    }

    #[test]
    fn test_rule_from_yaml() {
        let yaml = r#"
rules:
  - id: wind-stop
    name: Stop cranes in high wind
    module_name: crane
    priority: critical
    condition:
      kind: above
      field: wind_kn
      threshold: 30
    action:
      kind: label
      action: stop_cranes
    timeout_ms: 1500
  - name: Log loading
    module_name: crane
    action:
      kind: label
      action: log
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);

        let stop = &set.rules[0];
        assert_eq!(stop.priority, RulePriority::Critical);
        assert_eq!(stop.action.describe(), "stop_cranes");
        assert_eq!(stop.timeout_ms, Some(1500));
        assert!(matches!(stop.condition, RuleCondition::Above { .. }));

        let log = &set.rules[1];
        assert!(!log.id.is_empty());
        assert_eq!(log.priority, RulePriority::Medium);
        assert!(matches!(log.condition, RuleCondition::Always));
    }

    #[test]
    fn test_validation() {
        let rule = DecisionRule::new("", "crane", RuleAction::label("noop"));
        assert!(matches!(rule.validate(), Err(DecisionError::InvalidRule(_))));

        let rule = DecisionRule::new("ok", "crane", RuleAction::label("noop")).with_timeout_ms(0);
        assert!(rule.validate().is_err());

        let rule = DecisionRule::new("ok", "crane", RuleAction::label("noop"));
        assert!(rule.validate().is_ok());
        assert_eq!(format!("{:?}", rule.action), "Label(noop)");
    }
}
