//! Timeout-guarded action execution.
//!
//! Completion and timeout race for a set-once [`TerminalLatch`]. Whichever
//! settles it first decides the terminal status; the loser is discarded.

use crate::rules::RuleAction;
use crate::types::{DecisionContext, DecisionStatus};
use chrono::{DateTime, Utc};
use context_mesh::Clock;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// Terminal result of running (or waiting on) a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: DecisionStatus,
    /// Whether the action was started
    pub executed: bool,
    /// Action label reported by the action, if it completed
    pub action: Option<String>,
    pub error_message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn completed(action: Option<String>, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: DecisionStatus::Completed,
            executed: true,
            action,
            error_message: None,
            finished_at,
        }
    }

    pub fn failed(error: impl Into<String>, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: DecisionStatus::Failed,
            executed: true,
            action: None,
            error_message: Some(error.into()),
            finished_at,
        }
    }

    pub fn timed_out(timeout: Duration, executed: bool, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: DecisionStatus::Timeout,
            executed,
            action: None,
            error_message: Some(format!("timed out after {}ms", timeout.as_millis())),
            finished_at,
        }
    }

    pub fn success(&self) -> bool {
        self.status == DecisionStatus::Completed
    }
}

/// Set-once holder of a decision's terminal outcome.
#[derive(Debug, Default)]
pub struct TerminalLatch {
    outcome: OnceLock<ExecutionOutcome>,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle the latch. Returns `false` if it was already settled.
    pub fn settle(&self, outcome: ExecutionOutcome) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        self.outcome.get()
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }
}

/// Runs rule actions on their own task, raced against a timer.
pub struct TimeoutExecutor {
    clock: Arc<dyn Clock>,
    cancel_on_timeout: bool,
}

impl TimeoutExecutor {
    pub fn new(clock: Arc<dyn Clock>, cancel_on_timeout: bool) -> Self {
        Self {
            clock,
            cancel_on_timeout,
        }
    }

    /// Run `action` for `decision_id`, settling on completion, failure, panic
    /// or timeout, whichever comes first.
    ///
    /// A timed-out action keeps running unless `cancel_on_timeout` is set;
    /// its eventual result is logged at debug and dropped.
    pub async fn execute(
        &self,
        decision_id: &str,
        action: RuleAction,
        context: DecisionContext,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let latch = Arc::new(TerminalLatch::new());

        let mut task = tokio::spawn({
            let latch = Arc::clone(&latch);
            let clock = Arc::clone(&self.clock);
            let decision_id = decision_id.to_string();
            async move {
                let outcome = match action.run(&context).await {
                    Ok(label) => ExecutionOutcome::completed(Some(label), clock.now()),
                    Err(e) => ExecutionOutcome::failed(e.to_string(), clock.now()),
                };
                let status = outcome.status;
                if !latch.settle(outcome) {
                    debug!(
                        decision_id = %decision_id,
                        module = %context.module_name,
                        late_status = %status,
                        "Late action result discarded"
                    );
                }
            }
        });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let reason = if e.is_panic() {
                    "action panicked".to_string()
                } else {
                    format!("action task ended: {e}")
                };
                latch.settle(ExecutionOutcome::failed(reason, self.clock.now()));
            }
            Err(_) => {
                let won = latch.settle(ExecutionOutcome::timed_out(timeout, true, self.clock.now()));
                if won && self.cancel_on_timeout {
                    task.abort();
                }
            }
        }

        latch
            .outcome()
            .cloned()
            .unwrap_or_else(|| ExecutionOutcome::failed("action ended without a result", self.clock.now()))
    }
}
