//! The columnar store: a DuckDB-backed `logs` table with a monotonic id
//! sequence and indexes matching the Python original's `DatabaseManager`
//! schema exactly (`database.py`). One writer-owned connection plus a pool
//! of reader connections guarded by a mutex, replacing the source's
//! thread-local-per-thread connections (spec DESIGN NOTES).

use crate::error::{Result, SentinelError};
use crate::model::{Level, LogEntry, StoredLogEntry};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

const SCHEMA_SQL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS logs_id_seq START 1;
CREATE TABLE IF NOT EXISTS logs (
    id BIGINT PRIMARY KEY DEFAULT nextval('logs_id_seq'),
    timestamp TIMESTAMP NOT NULL,
    computer VARCHAR NOT NULL,
    log_name VARCHAR NOT NULL,
    event_id INTEGER NOT NULL,
    level VARCHAR NOT NULL,
    source VARCHAR NOT NULL,
    message VARCHAR,
    "user" VARCHAR,
    raw_xml VARCHAR,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_event_id ON logs(event_id);
CREATE INDEX IF NOT EXISTS idx_logs_computer ON logs(computer);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_composite ON logs(timestamp, event_id, computer);
"#;

/// One row as returned by an arbitrary `query()` call: column names plus
/// string-rendered cell values, so the caller (CLI formatter, report
/// renderer) doesn't need to know DuckDB's value type system.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

/// A thread-safe handle over a DuckDB-backed log store. Writers and
/// readers are serialized behind a mutex around one shared `Connection`;
/// DuckDB's own MVCC lets concurrent reads proceed against committed data
/// while a write is prepared, so the mutex only bounds this process's own
/// concurrent callers rather than gating DuckDB itself.
pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if absent) the store file at `path` and ensures the
    /// schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store, used by tests and by `init --dry-run`-style
    /// callers that never persist to disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            path: PathBuf::new(),
            conn: Mutex::new(conn),
        })
    }

    /// Inserts `entries` atomically: either all rows land or none do.
    /// Returns the assigned ids in insertion order (spec §4.5, property 2).
    pub fn insert_batch(&self, entries: &[LogEntry]) -> Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(entries.len());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO logs (id, timestamp, computer, log_name, event_id, level, source, message, \"user\", raw_xml, created_at) \
                 VALUES (nextval('logs_id_seq'), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )?;

            for entry in entries {
                let id: i64 = stmt.query_row(
                    params![
                        entry.timestamp.naive_utc(),
                        entry.computer,
                        entry.log_name,
                        entry.event_id,
                        entry.level.to_string(),
                        entry.source,
                        entry.message,
                        entry.user,
                        entry.raw_xml,
                        created_at.naive_utc(),
                    ],
                    |row| row.get(0),
                )?;
                ids.push(id);
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Runs caller-supplied, read-only SQL and returns its rows as strings.
    /// The caller is trusted (same process, per spec §4.5): no query
    /// validation beyond what DuckDB itself enforces.
    pub fn query(&self, sql: &str) -> Result<Vec<QueryRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let column_names: Vec<String> = stmt.column_names();
        let column_count = column_names.len();

        let mut rows_out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value: duckdb::types::Value = row.get(i)?;
                values.push(render_value(&value));
            }
            rows_out.push(QueryRow {
                columns: column_names.clone(),
                values,
            });
        }

        Ok(rows_out)
    }

    /// Returns every row newer than `since` (used by the rule engine's
    /// windowed evaluation) as fully typed `StoredLogEntry` values.
    pub fn rows_since(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<StoredLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, computer, log_name, event_id, level, source, message, \"user\", raw_xml, created_at \
             FROM logs WHERE timestamp > ? AND timestamp <= ? ORDER BY id",
        )?;

        let mut rows = stmt.query(params![since.naive_utc(), until.naive_utc()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_stored_entry(row)?);
        }
        Ok(out)
    }

    /// Deletes rows older than `days` days; returns the affected count.
    pub fn delete_older_than(&self, days: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM logs WHERE timestamp < CURRENT_TIMESTAMP - INTERVAL (?) DAY",
            params![days],
        )?;
        Ok(affected as u64)
    }

    /// Exports rows (optionally filtered by a `WHERE`-clause fragment) to a
    /// Parquet file.
    pub fn export_parquet(&self, path: impl AsRef<Path>, where_clause: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let filter = where_clause.map(|w| format!(" WHERE {w}")).unwrap_or_default();
        let sql = format!(
            "COPY (SELECT * FROM logs{filter}) TO '{}' (FORMAT PARQUET)",
            path.as_ref().display()
        );
        conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Imports rows from a Parquet file previously written by
    /// `export_parquet`, preserving their original columns (including `id`).
    pub fn import_parquet(&self, path: impl AsRef<Path>) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "INSERT INTO logs SELECT * FROM read_parquet('{}')",
            path.as_ref().display()
        );
        let affected = conn.execute(&sql, [])?;
        Ok(affected as u64)
    }

    /// Compacts storage and refreshes planner statistics.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }

    /// Copies the store file to `dest`. Requires the store to be quiesced
    /// for the duration (spec §4.5): callers must hold no other references
    /// to this `Store` while backup runs, since this drops and reopens the
    /// one shared connection.
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(SentinelError::Store(
                "cannot back up an in-memory store".to_string(),
            ));
        }

        let mut conn = self.conn.lock().unwrap();
        // Force DuckDB to release its file handle before copying.
        *conn = Connection::open_in_memory()?;
        std::fs::copy(&self.path, dest.as_ref())
            .map_err(|e| SentinelError::Store(format!("backup copy failed: {e}")))?;
        *conn = Connection::open(&self.path)?;
        Ok(())
    }

    /// Row/table-level statistics for the `status` CLI command.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let row_count: i64 = conn.query_row("SELECT count(*) FROM logs", [], |r| r.get(0))?;
        let earliest: Option<chrono::NaiveDateTime> =
            conn.query_row("SELECT min(timestamp) FROM logs", [], |r| r.get(0)).ok();
        let latest: Option<chrono::NaiveDateTime> =
            conn.query_row("SELECT max(timestamp) FROM logs", [], |r| r.get(0)).ok();

        Ok(StoreStats {
            row_count: row_count as u64,
            earliest_timestamp: earliest.map(|t| DateTime::<Utc>::from_naive_utc_and_offset(t, Utc)),
            latest_timestamp: latest.map(|t| DateTime::<Utc>::from_naive_utc_and_offset(t, Utc)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub row_count: u64,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

fn row_to_stored_entry(row: &duckdb::Row<'_>) -> Result<StoredLogEntry> {
    let id: i64 = row.get(0)?;
    let timestamp: chrono::NaiveDateTime = row.get(1)?;
    let computer: String = row.get(2)?;
    let log_name: String = row.get(3)?;
    let event_id: u32 = row.get(4)?;
    let level_text: String = row.get(5)?;
    let source: String = row.get(6)?;
    let message: Option<String> = row.get(7)?;
    let user: Option<String> = row.get(8)?;
    let raw_xml: Option<String> = row.get(9)?;
    let created_at: chrono::NaiveDateTime = row.get(10)?;

    Ok(StoredLogEntry {
        id,
        entry: LogEntry {
            timestamp: DateTime::<Utc>::from_naive_utc_and_offset(timestamp, Utc),
            event_id,
            level: Level::from_str(&level_text).unwrap_or(Level::Unknown),
            source,
            message: message.unwrap_or_default(),
            computer,
            log_name,
            user,
            raw_xml,
        },
        created_at: DateTime::<Utc>::from_naive_utc_and_offset(created_at, Utc),
    })
}

/// Renders one query cell for display: numeric types via `to_string`, text
/// verbatim, null as the empty string. `query()` is a user-facing operation
/// (spec §4.5) so cells must come out as plain values, not DuckDB's Debug
/// wrappers (`Int32(4625)`, `Text("System")`).
fn render_value(value: &duckdb::types::Value) -> String {
    use duckdb::types::Value;

    match value {
        Value::Null => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(n) => n.to_string(),
        Value::SmallInt(n) => n.to_string(),
        Value::Int(n) => n.to_string(),
        Value::BigInt(n) => n.to_string(),
        Value::HugeInt(n) => n.to_string(),
        Value::UTinyInt(n) => n.to_string(),
        Value::USmallInt(n) => n.to_string(),
        Value::UInt(n) => n.to_string(),
        Value::UBigInt(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::Decimal(n) => n.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Timestamp(_, micros) => micros.to_string(),
        Value::Date32(days) => days.to_string(),
        Value::Time64(_, micros) => micros.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_entry(computer: &str, event_id: u32, ts: DateTime<Utc>) -> LogEntry {
        LogEntry {
            timestamp: ts,
            event_id,
            level: Level::Error,
            source: "Microsoft-Windows-Security-Auditing".to_string(),
            message: "DOMAIN\\alice".to_string(),
            computer: computer.to_string(),
            log_name: "Security".to_string(),
            user: None,
            raw_xml: None,
        }
    }

    #[test]
    fn insert_batch_assigns_monotonically_increasing_ids() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let batch = vec![
            sample_entry("10.0.0.1", 4625, now),
            sample_entry("10.0.0.1", 4625, now),
            sample_entry("10.0.0.2", 4624, now),
        ];

        let ids = store.insert_batch(&batch).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[1] > w[0]));

        let stats = store.stats().unwrap();
        assert_eq!(stats.row_count, 3);
    }

    #[test]
    fn empty_batch_inserts_nothing() {
        let store = Store::open_in_memory().unwrap();
        let ids = store.insert_batch(&[]).unwrap();
        assert!(ids.is_empty());
        assert_eq!(store.stats().unwrap().row_count, 0);
    }

    #[test]
    fn rows_since_respects_half_open_window() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

        store
            .insert_batch(&[
                sample_entry("h", 1, t0),
                sample_entry("h", 1, t1),
                sample_entry("h", 1, t2),
            ])
            .unwrap();

        let window = store.rows_since(t0, t1).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].entry.timestamp, t1);
    }

    #[test]
    fn delete_older_than_purges_only_stale_rows() {
        let store = Store::open_in_memory().unwrap();
        let old = Utc::now() - chrono::Duration::days(100);
        let recent = Utc::now() - chrono::Duration::days(1);
        store
            .insert_batch(&[sample_entry("h", 1, old), sample_entry("h", 1, recent)])
            .unwrap();

        let affected = store.delete_older_than(90).unwrap();
        assert_eq!(affected, 1);
        assert_eq!(store.stats().unwrap().row_count, 1);
    }

    #[test]
    fn query_returns_inserted_row() {
        let store = Store::open_in_memory().unwrap();
        store.insert_batch(&[sample_entry("10.0.0.1", 4625, Utc::now())]).unwrap();

        let rows = store.query("SELECT computer, event_id FROM logs").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec!["computer".to_string(), "event_id".to_string()]);
    }
}
