//! Per-module rule registry.

use crate::error::{DecisionError, Result};
use crate::rules::{DecisionRule, RuleSet};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Rules keyed by module, in registration order.
#[derive(Default)]
pub struct RuleRegistry {
    by_module: DashMap<String, Vec<Arc<DecisionRule>>>,
    /// rule id -> module
    index: DashMap<String, String>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rule: DecisionRule) -> Result<()> {
        rule.validate()?;

        match self.index.entry(rule.id.clone()) {
            Entry::Occupied(_) => Err(DecisionError::DuplicateRule(rule.id)),
            Entry::Vacant(slot) => {
                slot.insert(rule.module_name.clone());
                debug!(
                    rule_id = %rule.id,
                    rule_name = %rule.name,
                    module = %rule.module_name,
                    priority = %rule.priority,
                    "Rule registered"
                );
                self.by_module
                    .entry(rule.module_name.clone())
                    .or_default()
                    .push(Arc::new(rule));
                Ok(())
            }
        }
    }

    /// Remove a rule. Returns `false` if the id is unknown.
    pub fn unregister(&self, rule_id: &str) -> bool {
        let Some((_, module_name)) = self.index.remove(rule_id) else {
            return false;
        };

        let now_empty = match self.by_module.get_mut(&module_name) {
            Some(mut rules) => {
                rules.retain(|r| r.id != rule_id);
                rules.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_module.remove_if(&module_name, |_, rules| rules.is_empty());
        }

        debug!(rule_id = %rule_id, module = %module_name, "Rule unregistered");
        true
    }

    /// Rules for a module, in registration order.
    pub fn rules_for(&self, module_name: &str) -> Vec<Arc<DecisionRule>> {
        self.by_module
            .get(module_name)
            .map(|rules| rules.clone())
            .unwrap_or_default()
    }

    /// Register every rule in a YAML rule set. Stops at the first invalid rule.
    pub fn load_yaml(&self, yaml: &str) -> Result<usize> {
        let set = RuleSet::from_yaml(yaml)?;
        let count = set.rules.len();
        for rule in set.rules {
            self.register(rule)?;
        }
        info!(count, "Loaded rules from YAML");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleAction;

    fn rule(id: &str, module: &str) -> DecisionRule {
        DecisionRule::new(format!("rule {id}"), module, RuleAction::label("noop")).with_id(id)
    }

    #[test]
    fn test_register_keeps_order_per_module() {
        let registry = RuleRegistry::new();
        registry.register(rule("a", "berth")).unwrap();
        registry.register(rule("b", "pilotage")).unwrap();
        registry.register(rule("c", "berth")).unwrap();

        let ids: Vec<_> = registry.rules_for("berth").iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.rules_for("customs").is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = RuleRegistry::new();
        registry.register(rule("a", "berth")).unwrap();
        let err = registry.register(rule("a", "pilotage")).unwrap_err();
        assert!(matches!(err, DecisionError::DuplicateRule(id) if id == "a"));
        assert!(registry.rules_for("pilotage").is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry = RuleRegistry::new();
        registry.register(rule("a", "berth")).unwrap();

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());
        assert!(registry.rules_for("berth").is_empty());

        // The id can be reused once removed.
        registry.register(rule("a", "berth")).unwrap();
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let registry = RuleRegistry::new();
        let err = registry.register(rule("x", "")).unwrap_err();
        assert!(matches!(err, DecisionError::InvalidRule(_)));
        assert!(registry.is_empty());
    }
}
