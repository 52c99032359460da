//! Persisted pending operations.
//!
//! A suspended run is not a blocked task: it is a [`PendingOperation`] record
//! plus the correlation entries pointing at it. Resumption loads the record
//! and continues from its stored state.

use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use parley_core::{
    AgentConfig, AgentOutcome, ConversationId, OperationId, TaskState, TurnRequest, WorkId,
};

use crate::correlation::CorrelationKey;
use crate::error::StoreError;

/// Everything needed to continue a suspended run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Operation the run belongs to.
    pub operation_id: OperationId,
    /// Agent the run talks to.
    pub agent: AgentConfig,
    /// Task name.
    pub task: String,
    /// Original task arguments.
    pub args: Value,
    /// Last turn sent; answers to later questions continue from it.
    pub last_request: TurnRequest,
    /// Conversation id disclosed by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Deferred-work id disclosed by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    /// Local lifecycle state at suspension.
    pub state: TaskState,
    /// Questions answered so far.
    pub clarification_rounds: u32,
    /// Round limit in force for this run.
    pub max_clarification_rounds: u32,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Set once the operation finished while records are kept around.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_outcome: Option<AgentOutcome>,
}

impl PendingOperation {
    /// Pair this record belongs to.
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.operation_id.clone(), self.agent.id.clone())
    }

    /// Whether the run has finished.
    pub fn is_closed(&self) -> bool {
        self.final_outcome.is_some() || self.state.is_terminal()
    }
}

/// Storage for suspended runs, keyed by pair.
pub trait PendingStore: Send + Sync {
    /// Insert or replace the record for its pair.
    fn save(&self, op: &PendingOperation) -> Result<(), StoreError>;
    /// Record for a pair, if any.
    fn get(&self, key: &CorrelationKey) -> Result<Option<PendingOperation>, StoreError>;
    /// Delete a pair's record. Returns whether one existed.
    fn remove(&self, key: &CorrelationKey) -> Result<bool, StoreError>;
    /// Every record, oldest first.
    fn list(&self) -> Result<Vec<PendingOperation>, StoreError>;
}

/// Process-local store; records are lost on exit.
#[derive(Default)]
pub struct InMemoryPendingStore {
    records: DashMap<CorrelationKey, PendingOperation>,
}

impl InMemoryPendingStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingStore for InMemoryPendingStore {
    fn save(&self, op: &PendingOperation) -> Result<(), StoreError> {
        let _ = self.records.insert(op.key(), op.clone());
        Ok(())
    }

    fn get(&self, key: &CorrelationKey) -> Result<Option<PendingOperation>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    fn remove(&self, key: &CorrelationKey) -> Result<bool, StoreError> {
        Ok(self.records.remove(key).is_some())
    }

    fn list(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let mut all: Vec<PendingOperation> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(all)
    }
}

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
";

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS pending_operations (
    operation_id    TEXT NOT NULL,
    agent_id        TEXT NOT NULL,
    state           TEXT NOT NULL,
    work_id         TEXT,
    conversation_id TEXT,
    record          TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (operation_id, agent_id)
);
CREATE INDEX IF NOT EXISTS idx_pending_work ON pending_operations(work_id);
CREATE INDEX IF NOT EXISTS idx_pending_conversation ON pending_operations(conversation_id);
";

/// SQLite-backed store; the full record is kept as a JSON column.
pub struct SqlitePendingStore {
    conn: Mutex<Connection>,
}

impl SqlitePendingStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        Self::init(conn, path.display().to_string())
    }

    /// Private in-memory database, for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self, StoreError> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
        info!(path = %label, "pending store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PendingStore for SqlitePendingStore {
    fn save(&self, op: &PendingOperation) -> Result<(), StoreError> {
        let record = serde_json::to_string(op)?;
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO pending_operations
                (operation_id, agent_id, state, work_id, conversation_id, record, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(operation_id, agent_id) DO UPDATE SET
                state = excluded.state,
                work_id = excluded.work_id,
                conversation_id = excluded.conversation_id,
                record = excluded.record,
                updated_at = excluded.updated_at",
            params![
                op.operation_id.as_str(),
                op.agent.id.as_str(),
                op.state.as_str(),
                op.work_id.as_ref().map(WorkId::as_str),
                op.conversation_id.as_ref().map(ConversationId::as_str),
                record,
                op.started_at.to_rfc3339(),
                op.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, key: &CorrelationKey) -> Result<Option<PendingOperation>, StoreError> {
        let conn = self.conn.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM pending_operations WHERE operation_id = ?1 AND agent_id = ?2",
                params![key.operation_id.as_str(), key.agent_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    fn remove(&self, key: &CorrelationKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM pending_operations WHERE operation_id = ?1 AND agent_id = ?2",
            params![key.operation_id.as_str(), key.agent_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn list(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT record FROM pending_operations ORDER BY started_at, operation_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{AgentId, OutcomeMetadata};
    use serde_json::json;

    fn record(op: &str, agent: &str) -> PendingOperation {
        let operation_id = OperationId::from_raw(op);
        let agent = AgentConfig::new(agent, "https://agent.test/a2a").with_auth_token("tok");
        PendingOperation {
            operation_id: operation_id.clone(),
            agent,
            task: "get_products".into(),
            args: json!({"brief": "coffee"}),
            last_request: TurnRequest::initial(operation_id, "get_products", json!({"brief": "coffee"})),
            conversation_id: Some(ConversationId::from_raw("ctx-1")),
            work_id: Some(WorkId::from_raw("w1")),
            state: TaskState::Working,
            clarification_rounds: 0,
            max_clarification_rounds: 3,
            started_at: Utc::now(),
            updated_at: Utc::now(),
            final_outcome: None,
        }
    }

    fn exercise(store: &dyn PendingStore) {
        let a = record("op_1", "a1");
        let b = record("op_1", "a2");
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        assert_eq!(store.get(&a.key()).unwrap(), Some(a.clone()));
        assert_eq!(store.list().unwrap().len(), 2);

        let mut updated = a.clone();
        updated.state = TaskState::Completed;
        updated.final_outcome = Some(AgentOutcome::completed(
            json!({"ok": true}),
            OutcomeMetadata::new(&updated.agent),
        ));
        store.save(&updated).unwrap();
        let loaded = store.get(&a.key()).unwrap().unwrap();
        assert!(loaded.is_closed());
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.remove(&a.key()).unwrap());
        assert!(!store.remove(&a.key()).unwrap());
        assert!(store.get(&a.key()).unwrap().is_none());
        let missing = CorrelationKey::new(OperationId::from_raw("nope"), AgentId::from_raw("a1"));
        assert!(store.get(&missing).unwrap().is_none());
    }

    #[test]
    fn in_memory_store() {
        exercise(&InMemoryPendingStore::new());
    }

    #[test]
    fn sqlite_store() {
        exercise(&SqlitePendingStore::in_memory().unwrap());
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pending.db");
        let rec = record("op_9", "a1");
        {
            let store = SqlitePendingStore::open(&path).unwrap();
            store.save(&rec).unwrap();
        }
        let store = SqlitePendingStore::open(&path).unwrap();
        let loaded = store.get(&rec.key()).unwrap().unwrap();
        assert_eq!(loaded.work_id, Some(WorkId::from_raw("w1")));
        assert_eq!(loaded.agent.auth_token.as_deref(), Some("tok"));
        assert!(!loaded.is_closed());
    }
}
