//! SC-006: Append-only execution ledger (SQLite).
//!
//! Rows are never updated in place except for the `collected` flag set by
//! garbage collection. "Latest non-collected row per stage name" is the cache key.

use super::error::Result;
use super::types::{ExecutionStatus, GcReport, ImplVersion, NewExecution, StageExecution};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

const COLUMNS: &str = "id, name, executed_us, status, stage_config, config_digest, \
                       filename, module_updated_us, collected";

/// Handle to the persisted execution history.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (or create) a ledger database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        debug!(path = %path.display(), "opened ledger");
        Ok(ledger)
    }

    /// An in-memory ledger (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS stage_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                executed_us INTEGER NOT NULL,
                status TEXT NOT NULL,
                stage_config TEXT NOT NULL,
                config_digest TEXT NOT NULL,
                filename TEXT,
                module_updated_us INTEGER NOT NULL,
                collected INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stage_executions_name
             ON stage_executions(name, executed_us)",
            [],
        )?;
        Ok(())
    }

    /// Close the underlying connection, surfacing any pending error.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e.into())
    }

    /// Append a row. Returns its id.
    pub fn append(&self, row: &NewExecution) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO stage_executions
                (name, executed_us, status, stage_config, config_digest, filename, module_updated_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &row.name,
                row.executed.timestamp_micros(),
                row.status.as_str(),
                &row.stage_config,
                &row.config_digest,
                &row.filename,
                row.module_updated.0,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(stage = %row.name, id, status = %row.status, "ledger append");
        Ok(id)
    }

    /// Most recent non-collected row for a stage.
    pub fn latest(&self, name: &str) -> Result<Option<StageExecution>> {
        let sql = format!(
            "SELECT {} FROM stage_executions
             WHERE name = ?1 AND collected = 0
             ORDER BY executed_us DESC, id DESC LIMIT 1",
            COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![name], row_to_execution)
            .optional()?;
        Ok(row)
    }

    /// Every row for a stage, oldest first, including collected ones.
    pub fn history(&self, name: &str) -> Result<Vec<StageExecution>> {
        let sql = format!(
            "SELECT {} FROM stage_executions WHERE name = ?1 ORDER BY executed_us, id",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![name], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest non-collected row of every stage, ordered by stage name.
    pub fn latest_per_stage(&self) -> Result<Vec<StageExecution>> {
        let mut latest: HashMap<String, StageExecution> = HashMap::new();
        for row in self.live_rows()? {
            match latest.get(&row.name) {
                Some(existing) if sort_key(existing) >= sort_key(&row) => {}
                _ => {
                    latest.insert(row.name.clone(), row);
                }
            }
        }
        let mut rows: Vec<StageExecution> = latest.into_values().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    /// Total number of rows, collected or not.
    pub fn row_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM stage_executions", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn live_rows(&self) -> Result<Vec<StageExecution>> {
        let sql = format!(
            "SELECT {} FROM stage_executions WHERE collected = 0 ORDER BY name, executed_us, id",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Keep the latest "ok" row per stage; mark every older row collected and
    /// delete the artifact files only those rows referenced.
    pub fn collect_garbage(&self, artifact_dir: &Path) -> Result<GcReport> {
        let rows = self.live_rows()?;

        let mut keep: HashMap<&str, (i64, i64)> = HashMap::new();
        for row in rows.iter().filter(|r| r.status == ExecutionStatus::Ok) {
            let key = sort_key(row);
            let slot = keep.entry(row.name.as_str()).or_insert(key);
            if key > *slot {
                *slot = key;
            }
        }

        let superseded = |row: &StageExecution| {
            keep.get(row.name.as_str())
                .is_some_and(|kept| sort_key(row) < *kept)
        };

        let retained_files: HashSet<&str> = rows
            .iter()
            .filter(|&r| !superseded(r))
            .filter_map(|r| r.filename.as_deref())
            .collect();

        let mut report = GcReport {
            stages_kept: keep.len() as u32,
            ..GcReport::default()
        };
        let mut doomed: Vec<&str> = Vec::new();

        let tx = self.conn.unchecked_transaction()?;
        for row in rows.iter().filter(|&r| superseded(r)) {
            tx.execute(
                "UPDATE stage_executions SET collected = 1 WHERE id = ?1",
                params![row.id],
            )?;
            report.rows_collected += 1;

            if let Some(filename) = row.filename.as_deref() {
                if !retained_files.contains(filename) && !doomed.contains(&filename) {
                    doomed.push(filename);
                }
            }
        }
        tx.commit()?;

        // Files go only once no live row can point at them
        for filename in doomed {
            match std::fs::remove_file(artifact_dir.join(filename)) {
                Ok(()) => report.files_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.files_missing += 1,
                Err(e) => {
                    warn!(file = filename, error = %e, "cannot remove collected artifact");
                    report.files_failed += 1;
                }
            }
        }

        info!(
            stages = report.stages_kept,
            rows = report.rows_collected,
            files = report.files_removed,
            "ledger garbage collection complete"
        );
        Ok(report)
    }
}

fn sort_key(row: &StageExecution) -> (i64, i64) {
    (row.executed.timestamp_micros(), row.id)
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageExecution> {
    let executed_us: i64 = row.get(2)?;
    let executed = DateTime::<Utc>::from_timestamp_micros(executed_us)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, executed_us))?;
    let status_text: String = row.get(3)?;
    let status = status_text.parse::<ExecutionStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(StageExecution {
        id: row.get(0)?,
        name: row.get(1)?,
        executed,
        status,
        stage_config: row.get(4)?,
        config_digest: row.get(5)?,
        filename: row.get(6)?,
        module_updated: ImplVersion(row.get(7)?),
        collected: row.get::<_, i64>(8)? != 0,
    })
}
