//! Transactional fallback tier on SQLite.
//!
//! Tables:
//! - `context_records` - one row per persisted context message
//! - `decision_records` - the decision audit log, keyed by decision id

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::store::{assign_id, DurableStore};
use crate::types::{
    is_terminal_status, ContextQuery, ContextRecord, DecisionQuery, DecisionRecord,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS context_records (
    id TEXT PRIMARY KEY,
    module_name TEXT NOT NULL,
    context_type TEXT NOT NULL,
    context_data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    sync_status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_context_module_type
    ON context_records (module_name, context_type, timestamp);

CREATE TABLE IF NOT EXISTS decision_records (
    decision_id TEXT PRIMARY KEY,
    module_name TEXT NOT NULL,
    decision_level TEXT NOT NULL,
    decision_type TEXT NOT NULL,
    context TEXT NOT NULL,
    action TEXT NOT NULL,
    priority TEXT NOT NULL,
    status TEXT NOT NULL,
    timeout_ms INTEGER NOT NULL,
    executed INTEGER NOT NULL,
    success INTEGER,
    error_message TEXT,
    simulation_results TEXT,
    escalation_reason TEXT,
    timestamp TEXT NOT NULL,
    executed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_decision_module
    ON decision_records (module_name, timestamp);
";

const DECISION_COLUMNS: &str = "decision_id, module_name, decision_level, decision_type, context, \
     action, priority, status, timeout_ms, executed, success, error_message, \
     simulation_results, escalation_reason, timestamp, executed_at";

/// SQLite-backed store.
pub struct SqliteStore {
    name: String,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("creating {}: {}", parent.display(), e)))?;
        }
        info!(path = %path.display(), "Opening SQLite store");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite store");
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            name: "sqlite".to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed-width so lexical order in SQL matches chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("bad timestamp '{}': {}", raw, e)))
}

struct RawContextRow {
    id: String,
    module_name: String,
    context_type: String,
    context_data: String,
    timestamp: String,
    source: String,
    sync_status: String,
}

impl RawContextRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            module_name: row.get(1)?,
            context_type: row.get(2)?,
            context_data: row.get(3)?,
            timestamp: row.get(4)?,
            source: row.get(5)?,
            sync_status: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<ContextRecord> {
        Ok(ContextRecord {
            id: self.id,
            module_name: self.module_name,
            context_type: self.context_type.parse()?,
            context_data: serde_json::from_str(&self.context_data)?,
            timestamp: parse_ts(&self.timestamp)?,
            source: self.source,
            sync_status: self.sync_status.parse()?,
        })
    }
}

struct RawDecisionRow {
    decision_id: String,
    module_name: String,
    decision_level: String,
    decision_type: String,
    context: String,
    action: String,
    priority: String,
    status: String,
    timeout_ms: i64,
    executed: bool,
    success: Option<bool>,
    error_message: Option<String>,
    simulation_results: Option<String>,
    escalation_reason: Option<String>,
    timestamp: String,
    executed_at: Option<String>,
}

impl RawDecisionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            decision_id: row.get(0)?,
            module_name: row.get(1)?,
            decision_level: row.get(2)?,
            decision_type: row.get(3)?,
            context: row.get(4)?,
            action: row.get(5)?,
            priority: row.get(6)?,
            status: row.get(7)?,
            timeout_ms: row.get(8)?,
            executed: row.get(9)?,
            success: row.get(10)?,
            error_message: row.get(11)?,
            simulation_results: row.get(12)?,
            escalation_reason: row.get(13)?,
            timestamp: row.get(14)?,
            executed_at: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<DecisionRecord> {
        Ok(DecisionRecord {
            decision_id: self.decision_id,
            module_name: self.module_name,
            decision_level: self.decision_level,
            decision_type: self.decision_type,
            context: serde_json::from_str(&self.context)?,
            action: self.action,
            priority: self.priority,
            status: self.status,
            timeout_ms: u64::try_from(self.timeout_ms).unwrap_or_default(),
            executed: self.executed,
            success: self.success,
            error_message: self.error_message,
            simulation_results: self
                .simulation_results
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            escalation_reason: self.escalation_reason,
            timestamp: parse_ts(&self.timestamp)?,
            executed_at: self.executed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn insert_context(&self, mut record: ContextRecord) -> Result<String> {
        let id = assign_id(&mut record);
        let data = serde_json::to_string(&record.context_data)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO context_records
                (id, module_name, context_type, context_data, timestamp, source, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                record.module_name,
                record.context_type.as_str(),
                data,
                format_ts(&record.timestamp),
                record.source,
                record.sync_status.as_str(),
            ],
        )?;
        debug!(id = %id, module = %record.module_name, "Stored context record");
        Ok(id)
    }

    async fn query_contexts(&self, query: &ContextQuery) -> Result<Vec<ContextRecord>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;

        let rows = match query.context_type {
            Some(context_type) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, module_name, context_type, context_data, timestamp, source, sync_status
                     FROM context_records
                     WHERE module_name = ?1 AND context_type = ?2
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(
                        params![query.module_name, context_type.as_str(), limit],
                        RawContextRow::from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, module_name, context_type, context_data, timestamp, source, sync_status
                     FROM context_records
                     WHERE module_name = ?1
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![query.module_name, limit], RawContextRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter().map(RawContextRow::into_record).collect()
    }

    async fn upsert_decision(&self, record: &DecisionRecord) -> Result<()> {
        let context = serde_json::to_string(&record.context)?;
        let simulations = record
            .simulation_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM decision_records WHERE decision_id = ?1",
                [&record.decision_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.as_deref().is_some_and(is_terminal_status) {
            return Err(StoreError::TerminalStateFrozen(record.decision_id.clone()));
        }

        tx.execute(
            &format!(
                "INSERT INTO decision_records ({DECISION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(decision_id) DO UPDATE SET
                    decision_level = excluded.decision_level,
                    decision_type = excluded.decision_type,
                    context = excluded.context,
                    action = excluded.action,
                    priority = excluded.priority,
                    status = excluded.status,
                    timeout_ms = excluded.timeout_ms,
                    executed = excluded.executed,
                    success = excluded.success,
                    error_message = excluded.error_message,
                    simulation_results = excluded.simulation_results,
                    escalation_reason = excluded.escalation_reason,
                    executed_at = excluded.executed_at"
            ),
            params![
                record.decision_id,
                record.module_name,
                record.decision_level,
                record.decision_type,
                context,
                record.action,
                record.priority,
                record.status,
                i64::try_from(record.timeout_ms).unwrap_or(i64::MAX),
                record.executed,
                record.success,
                record.error_message,
                simulations,
                record.escalation_reason,
                format_ts(&record.timestamp),
                record.executed_at.as_ref().map(format_ts),
            ],
        )?;
        tx.commit()?;

        debug!(decision_id = %record.decision_id, status = %record.status, "Stored decision record");
        Ok(())
    }

    async fn contains_decision(&self, decision_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM decision_records WHERE decision_id = ?1",
                [decision_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> Result<Vec<DecisionRecord>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;

        let rows = match &query.module_name {
            Some(module) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {DECISION_COLUMNS} FROM decision_records
                     WHERE module_name = ?1
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![module, limit], RawDecisionRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {DECISION_COLUMNS} FROM decision_records
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit], RawDecisionRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter().map(RawDecisionRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextType, SyncStatus};
    use chrono::Duration;

    fn record(module: &str, offset_secs: i64) -> ContextRecord {
        ContextRecord {
            id: String::new(),
            module_name: module.to_string(),
            context_type: ContextType::Telemetry,
            context_data: serde_json::json!({"rpm": 1200 + offset_secs}),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            source: "engine-room".to_string(),
            sync_status: SyncStatus::Pending,
        }
    }

    fn decision(id: &str, status: &str) -> DecisionRecord {
        DecisionRecord {
            decision_id: id.to_string(),
            module_name: "engine".to_string(),
            decision_level: "escalated".to_string(),
            decision_type: "operational".to_string(),
            context: serde_json::json!({"module_name": "engine"}),
            action: "escalate".to_string(),
            priority: "critical".to_string(),
            status: status.to_string(),
            timeout_ms: 30_000,
            executed: false,
            success: None,
            error_message: None,
            simulation_results: Some(serde_json::json!([{"scenario": "balanced"}])),
            escalation_reason: Some("2 rules matched".to_string()),
            timestamp: Utc::now(),
            executed_at: None,
        }
    }

    #[tokio::test]
    async fn test_context_round_trip_ordering() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_context(record("engine", 0)).await.unwrap();
        store.insert_context(record("engine", 60)).await.unwrap();
        store.insert_context(record("nav", 120)).await.unwrap();

        let results = store
            .query_contexts(&ContextQuery::new("engine", 10).with_type(ContextType::Telemetry))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].context_data["rpm"], 1260);
        assert_eq!(results[0].sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_decision_upsert_and_freeze() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_decision(&decision("d-1", "pending")).await.unwrap();
        assert!(store.contains_decision("d-1").await.unwrap());

        let mut done = decision("d-1", "completed");
        done.executed = true;
        done.success = Some(true);
        done.executed_at = Some(Utc::now());
        store.upsert_decision(&done).await.unwrap();

        let err = store
            .upsert_decision(&decision("d-1", "timeout"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalStateFrozen(_)));

        let stored = store
            .query_decisions(&DecisionQuery::for_module("engine", 5))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, "completed");
        assert_eq!(stored[0].success, Some(true));
        assert!(stored[0].simulation_results.is_some());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh").join("fallback.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_context(record("nav", 0)).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let results = reopened
            .query_contexts(&ContextQuery::new("nav", 10))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
