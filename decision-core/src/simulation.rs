//! What-if simulations for escalated decisions.

use crate::error::{DecisionError, Result};
use crate::types::{DecisionContext, RulePriority, Scenario, SimulationResult};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Input shared by every scenario of one escalation.
#[derive(Debug, Clone)]
pub struct SimulationInput {
    pub context: DecisionContext,
    /// Number of rules that matched
    pub matched_rules: usize,
    pub top_priority: Option<RulePriority>,
}

impl SimulationInput {
    pub fn new(context: DecisionContext) -> Self {
        Self {
            context,
            matched_rules: 0,
            top_priority: None,
        }
    }
}

/// Runs one scenario.
#[async_trait::async_trait]
pub trait Simulator: Send + Sync {
    async fn simulate(&self, scenario: Scenario, input: &SimulationInput) -> Result<SimulationResult>;
}

/// Deterministic simulator driven by a static per-scenario table.
///
/// Confidence drops by 0.05 for every matched rule past the first, and by
/// 0.05 (high) or 0.10 (critical) for the top matched priority.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicSimulator;

struct Profile {
    outcome: &'static str,
    confidence: f64,
    risks: &'static [&'static str],
    benefits: &'static [&'static str],
}

fn profile(scenario: Scenario) -> Profile {
    match scenario {
        Scenario::Optimistic => Profile {
            outcome: "Action resolves the situation with minimal disruption",
            confidence: 0.85,
            risks: &["Conditions deteriorate faster than forecast"],
            benefits: &["Fast resolution", "Schedule preserved"],
        },
        Scenario::Pessimistic => Profile {
            outcome: "Action fails to contain the situation",
            confidence: 0.35,
            risks: &["Extended delays", "Secondary incidents"],
            benefits: &["Contingency resources mobilised early"],
        },
        Scenario::Balanced => Profile {
            outcome: "Action contains the situation with moderate delay",
            confidence: 0.65,
            risks: &["Partial schedule slip"],
            benefits: &["Risk reduced", "Operations continue"],
        },
        Scenario::HighRisk => Profile {
            outcome: "Situation escalates despite the action",
            confidence: 0.25,
            risks: &["Safety exposure", "Asset damage", "Port closure"],
            benefits: &["Incident data for review"],
        },
        Scenario::LowRisk => Profile {
            outcome: "Situation stabilises with routine handling",
            confidence: 0.75,
            risks: &["Complacency"],
            benefits: &["Minimal resource use"],
        },
    }
}

#[async_trait::async_trait]
impl Simulator for HeuristicSimulator {
    async fn simulate(&self, scenario: Scenario, input: &SimulationInput) -> Result<SimulationResult> {
        let profile = profile(scenario);
        let extra_rules = input.matched_rules.saturating_sub(1) as f64;
        let priority_penalty = match input.top_priority {
            Some(RulePriority::Critical) => 0.10,
            Some(RulePriority::High) => 0.05,
            _ => 0.0,
        };
        let confidence = profile.confidence - 0.05 * extra_rules - priority_penalty;

        Ok(SimulationResult::new(
            scenario,
            format!("{}: {}", input.context.module_name, profile.outcome),
            confidence,
        )
        .with_risks(profile.risks.iter().copied())
        .with_benefits(profile.benefits.iter().copied()))
    }
}

/// Runs the scenario menu concurrently with wait-for-all, keep-successes
/// semantics.
pub struct SimulationRunner {
    simulator: Arc<dyn Simulator>,
    scenarios: Vec<Scenario>,
    timeout: Duration,
}

impl SimulationRunner {
    pub fn new(simulator: Arc<dyn Simulator>, scenarios: Vec<Scenario>, timeout: Duration) -> Self {
        Self {
            simulator,
            scenarios,
            timeout,
        }
    }

    /// One task per scenario. Failed, panicked and timed-out simulations are
    /// dropped with a warning; results keep scenario order.
    ///
    /// Errors only when every task was cancelled by the runtime.
    pub async fn run(&self, input: SimulationInput) -> Result<Vec<SimulationResult>> {
        let input = Arc::new(input);
        let tasks = self.scenarios.iter().map(|&scenario| {
            let simulator = Arc::clone(&self.simulator);
            let input = Arc::clone(&input);
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::timeout(timeout, simulator.simulate(scenario, &input)).await
            })
        });
        let outcomes = join_all(tasks).await;

        let mut results = Vec::with_capacity(self.scenarios.len());
        let mut cancelled = 0;
        for (scenario, outcome) in self.scenarios.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(Ok(result))) => results.push(result),
                Ok(Ok(Err(e))) => {
                    warn!(scenario = %scenario, error = %e, "Simulation failed, dropping result")
                }
                Ok(Err(_)) => warn!(
                    scenario = %scenario,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Simulation timed out, dropping result"
                ),
                Err(e) if e.is_cancelled() => {
                    cancelled += 1;
                    warn!(scenario = %scenario, "Simulation task cancelled");
                }
                Err(e) => warn!(scenario = %scenario, error = %e, "Simulation panicked, dropping result"),
            }
        }

        if !self.scenarios.is_empty() && cancelled == self.scenarios.len() {
            return Err(DecisionError::Simulation(
                "every simulation task was cancelled".to_string(),
            ));
        }

        debug!(
            module = %input.context.module_name,
            requested = self.scenarios.len(),
            succeeded = results.len(),
            "Simulations finished"
        );
        Ok(results)
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        fail: Scenario,
        stall: Option<Scenario>,
    }

    #[async_trait::async_trait]
    impl Simulator for Flaky {
        async fn simulate(&self, scenario: Scenario, input: &SimulationInput) -> Result<SimulationResult> {
            if scenario == self.fail {
                return Err(DecisionError::Simulation("model diverged".into()));
            }
            if Some(scenario) == self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            HeuristicSimulator.simulate(scenario, input).await
        }
    }

    fn runner(simulator: impl Simulator + 'static) -> SimulationRunner {
        SimulationRunner::new(Arc::new(simulator), Scenario::ALL.to_vec(), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_one_failure_leaves_four_results() {
        let runner = runner(Flaky {
            fail: Scenario::Balanced,
            stall: None,
        });
        let results = runner
            .run(SimulationInput::new(DecisionContext::new("pilotage")))
            .await
            .unwrap();

        let scenarios: Vec<_> = results.iter().map(|r| r.scenario).collect();
        assert_eq!(
            scenarios,
            vec![
                Scenario::Optimistic,
                Scenario::Pessimistic,
                Scenario::HighRisk,
                Scenario::LowRisk
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_simulation_dropped() {
        let runner = runner(Flaky {
            fail: Scenario::Pessimistic,
            stall: Some(Scenario::Optimistic),
        });
        let start = std::time::Instant::now();
        let results = runner
            .run(SimulationInput::new(DecisionContext::new("pilotage")))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_heuristic_confidence_adjusts() {
        let mut input = SimulationInput::new(DecisionContext::new("berth"));
        let base = HeuristicSimulator
            .simulate(Scenario::Balanced, &input)
            .await
            .unwrap();
        assert!((base.confidence - 0.65).abs() < 1e-9);

        input.matched_rules = 3;
        input.top_priority = Some(RulePriority::Critical);
        let adjusted = HeuristicSimulator
            .simulate(Scenario::Balanced, &input)
            .await
            .unwrap();
        assert!((adjusted.confidence - 0.45).abs() < 1e-9);
        assert!(adjusted.outcome.starts_with("berth:"));
        assert!(!adjusted.risks.is_empty());
    }
}
