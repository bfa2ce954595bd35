//! Record types persisted by every store tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Decision statuses after which no further mutation is accepted.
pub const TERMINAL_STATUSES: [&str; 3] = ["completed", "failed", "timeout"];

/// Returns true when `status` is one of [`TERMINAL_STATUSES`].
pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL_STATUSES.contains(&status)
}

/// Kind of fact carried on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Mission plans and voyage state
    Mission,
    /// Risk assessments
    Risk,
    /// Output of automated reasoning modules
    Ai,
    /// Forecasts
    Prediction,
    /// Raw sensor and vessel telemetry
    Telemetry,
}

impl ContextType {
    /// Every context type, in declaration order.
    pub const ALL: [ContextType; 5] = [
        ContextType::Mission,
        ContextType::Risk,
        ContextType::Ai,
        ContextType::Prediction,
        ContextType::Telemetry,
    ];

    /// Stable label used in persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Mission => "mission",
            ContextType::Risk => "risk",
            ContextType::Ai => "ai",
            ContextType::Prediction => "prediction",
            ContextType::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::UnknownContextType(s.to_string()))
    }
}

/// Persistence state of a context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not yet written to the durable store
    #[default]
    Pending,
    /// Written to the durable store
    Synced,
    /// Given up on
    Failed,
}

impl SyncStatus {
    /// Stable label used in persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(StoreError::UnknownSyncStatus(other.to_string())),
        }
    }
}

/// Persisted form of a context message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Store-assigned identifier; empty until written
    #[serde(default)]
    pub id: String,
    /// Originating module
    pub module_name: String,
    /// Context type
    pub context_type: ContextType,
    /// Opaque payload
    pub context_data: serde_json::Value,
    /// Publisher timestamp
    pub timestamp: DateTime<Utc>,
    /// Provenance label
    pub source: String,
    /// Persistence state at write time
    pub sync_status: SyncStatus,
}

/// Filter for context history reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextQuery {
    pub module_name: String,
    pub context_type: Option<ContextType>,
    pub limit: usize,
}

impl ContextQuery {
    /// Query every context type for a module.
    pub fn new(module_name: impl Into<String>, limit: usize) -> Self {
        Self {
            module_name: module_name.into(),
            context_type: None,
            limit,
        }
    }

    /// Restrict to one context type.
    pub fn with_type(mut self, context_type: ContextType) -> Self {
        self.context_type = Some(context_type);
        self
    }

    /// Whether a record passes this filter (ignores the limit).
    pub fn matches(&self, record: &ContextRecord) -> bool {
        record.module_name == self.module_name
            && self
                .context_type
                .map_or(true, |t| t == record.context_type)
    }
}

/// Persisted form of a decision, written to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub module_name: String,
    pub decision_level: String,
    pub decision_type: String,
    pub context: serde_json::Value,
    pub action: String,
    pub priority: String,
    pub status: String,
    pub timeout_ms: u64,
    pub executed: bool,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub simulation_results: Option<serde_json::Value>,
    pub escalation_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl DecisionRecord {
    /// Whether the recorded status is final.
    pub fn is_terminal(&self) -> bool {
        is_terminal_status(&self.status)
    }
}

/// Filter for decision history reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionQuery {
    pub module_name: Option<String>,
    pub limit: usize,
}

impl DecisionQuery {
    /// Query across all modules.
    pub fn all(limit: usize) -> Self {
        Self {
            module_name: None,
            limit,
        }
    }

    /// Query one module.
    pub fn for_module(module_name: impl Into<String>, limit: usize) -> Self {
        Self {
            module_name: Some(module_name.into()),
            limit,
        }
    }

    /// Whether a record passes this filter (ignores the limit).
    pub fn matches(&self, record: &DecisionRecord) -> bool {
        self.module_name
            .as_deref()
            .map_or(true, |m| m == record.module_name)
    }
}

/// Combine context reads from several stores: one copy per id, newest
/// first, at most `limit`.
pub fn merge_context_records(
    records: impl IntoIterator<Item = ContextRecord>,
    limit: usize,
) -> Vec<ContextRecord> {
    let mut seen = HashSet::new();
    let mut merged: Vec<ContextRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    merged.truncate(limit);
    merged
}

/// Combine decision reads from several stores: one row per decision id,
/// newest first, at most `limit`.
///
/// A terminal row beats a non-terminal one; otherwise the first row seen wins.
pub fn merge_decision_records(
    records: impl IntoIterator<Item = DecisionRecord>,
    limit: usize,
) -> Vec<DecisionRecord> {
    let mut by_id: HashMap<String, DecisionRecord> = HashMap::new();
    for record in records {
        match by_id.get(&record.decision_id) {
            Some(existing) if existing.is_terminal() || !record.is_terminal() => {}
            _ => {
                by_id.insert(record.decision_id.clone(), record);
            }
        }
    }

    let mut merged: Vec<DecisionRecord> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.decision_id.cmp(&b.decision_id))
    });
    merged.truncate(limit);
    merged
}
