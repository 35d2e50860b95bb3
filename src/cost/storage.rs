//! Storage ports for the append-only token-usage log.

use super::types::TokenUsage;
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Port for cost-record persistence.
///
/// Implementations must make `save` an atomic append per record; readers
/// tolerate records written out of timestamp order by concurrent writers.
pub trait CostStorage: Send + Sync {
    /// Append a single usage record.
    fn save(&self, record: &TokenUsage) -> Result<()>;

    /// All stored records.
    fn load_all(&self) -> Result<Vec<TokenUsage>>;

    /// Records whose timestamp falls on the given date.
    fn load_by_date(&self, date: NaiveDate) -> Result<Vec<TokenUsage>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.date() == date)
            .collect())
    }

    /// Records tagged with the given coordination id.
    fn load_by_coordination(&self, coordination_id: &str) -> Result<Vec<TokenUsage>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.coordination_id.as_deref() == Some(coordination_id))
            .collect())
    }
}

/// In-memory storage for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCostStorage {
    records: Mutex<Vec<TokenUsage>>,
}

impl MemoryCostStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CostStorage for MemoryCostStorage {
    fn save(&self, record: &TokenUsage) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::storage("record lock poisoned"))?
            .push(record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<TokenUsage>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| Error::storage("record lock poisoned"))?
            .clone())
    }
}

/// Line-delimited JSON storage, one record per line.
pub struct JsonlCostStorage {
    path: PathBuf,
}

impl JsonlCostStorage {
    /// Storage at an explicit file path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Conventional location under a logs directory.
    pub fn in_dir(logs_dir: impl AsRef<Path>) -> Self {
        Self::new(logs_dir.as_ref().join("token_usage.jsonl"))
    }
}

impl CostStorage for JsonlCostStorage {
    fn save(&self, record: &TokenUsage) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage(e.to_string()))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::storage(e.to_string()))?;
        // Single write of the whole line keeps the append atomic at line
        // granularity.
        file.write_all(line.as_bytes())
            .map_err(|e| Error::storage(e.to_string()))
    }

    fn load_all(&self) -> Result<Vec<TokenUsage>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(e.to_string())),
        };
        let mut records = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed usage record"),
            }
        }
        Ok(records)
    }
}

/// SQLite-backed storage for longer-lived installations.
pub struct SqliteCostStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCostStorage {
    /// Open or create a usage database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;
        Self::initialize(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS token_usage (
                timestamp TEXT NOT NULL,
                operation TEXT NOT NULL,
                tokens_used INTEGER NOT NULL,
                estimated_cost REAL NOT NULL,
                model TEXT NOT NULL,
                success INTEGER NOT NULL,
                workflow_id TEXT,
                coordination_id TEXT,
                phase_id TEXT,
                adapter_name TEXT
            )",
            [],
        )
        .map_err(|e| Error::storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::storage("connection lock poisoned"))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    fn query(&self, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<TokenUsage>> {
        let sql = format!(
            "SELECT timestamp, operation, tokens_used, estimated_cost, model, success,
                    workflow_id, coordination_id, phase_id, adapter_name
             FROM token_usage {} ORDER BY rowid",
            where_clause
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(args, |row| {
                let timestamp: String = row.get(0)?;
                let timestamp = timestamp
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now());
                Ok(TokenUsage {
                    timestamp,
                    operation: row.get(1)?,
                    tokens_used: row.get::<_, i64>(2)? as u64,
                    estimated_cost: row.get(3)?,
                    model: row.get(4)?,
                    success: row.get::<_, i64>(5)? != 0,
                    workflow_id: row.get(6)?,
                    coordination_id: row.get(7)?,
                    phase_id: row.get(8)?,
                    adapter_name: row.get(9)?,
                })
            })?;
            rows.collect()
        })
    }
}

impl CostStorage for SqliteCostStorage {
    fn save(&self, record: &TokenUsage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO token_usage (
                    timestamp, operation, tokens_used, estimated_cost, model, success,
                    workflow_id, coordination_id, phase_id, adapter_name
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.timestamp.to_rfc3339(),
                    record.operation,
                    record.tokens_used as i64,
                    record.estimated_cost,
                    record.model,
                    record.success as i64,
                    record.workflow_id,
                    record.coordination_id,
                    record.phase_id,
                    record.adapter_name,
                ],
            )
            .map(|_| ())
        })
    }

    fn load_all(&self) -> Result<Vec<TokenUsage>> {
        self.query("", &[])
    }

    fn load_by_date(&self, date: NaiveDate) -> Result<Vec<TokenUsage>> {
        let iso = date.format("%Y-%m-%d").to_string();
        self.query("WHERE substr(timestamp, 1, 10) = ?1", &[&iso])
    }

    fn load_by_coordination(&self, coordination_id: &str) -> Result<Vec<TokenUsage>> {
        self.query("WHERE coordination_id = ?1", &[&coordination_id])
    }
}
