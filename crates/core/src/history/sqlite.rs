//! SQLite history store.

use super::{format_timestamp, CloseDetails, HistoryError, HistoryRecord, HistoryStats, HistoryStatus, HistoryStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversions (
    job_id TEXT PRIMARY KEY,
    input_path TEXT NOT NULL,
    output_path TEXT,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    encode_seconds REAL,
    backend TEXT,
    error TEXT,
    input_size INTEGER,
    output_size INTEGER,
    last_position_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_conversions_started ON conversions(started_at);
CREATE INDEX IF NOT EXISTS idx_conversions_status ON conversions(status);
";

const COLUMNS: &str = "job_id, input_path, output_path, status, started_at, finished_at, \
     encode_seconds, backend, error, input_size, output_size, last_position_ms";

/// History store backed by a SQLite database.
///
/// Writes go through one shared connection. On file-backed stores each read
/// opens its own read-only connection, so queries do not wait on the writer.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteHistoryStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, HistoryError> {
        match &self.path {
            Some(path) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                Ok(f(&conn)?)
            }
            None => Ok(f(&self.writer())?),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn opt_u64(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

fn opt_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let status: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let finished_at: Option<String> = row.get(5)?;

    Ok(HistoryRecord {
        job_id: row.get(0)?,
        input_path: PathBuf::from(row.get::<_, String>(1)?),
        output_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        status: HistoryStatus::parse(&status).unwrap_or(HistoryStatus::Failed),
        started_at: parse_timestamp(&started_at).unwrap_or_default(),
        finished_at: finished_at.as_deref().and_then(parse_timestamp),
        encode_seconds: row.get(6)?,
        backend: row.get(7)?,
        error: row.get(8)?,
        input_size: opt_u64(row.get(9)?),
        output_size: opt_u64(row.get(10)?),
        last_position_ms: opt_u64(row.get(11)?),
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl HistoryStore for SqliteHistoryStore {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn insert(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let conn = self.writer();
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO conversions ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                COLUMNS
            ),
            params![
                record.job_id,
                path_text(&record.input_path),
                record.output_path.as_deref().map(path_text),
                record.status.as_str(),
                format_timestamp(&record.started_at),
                record.finished_at.as_ref().map(format_timestamp),
                record.encode_seconds,
                record.backend,
                record.error,
                opt_i64(record.input_size),
                opt_i64(record.output_size),
                opt_i64(record.last_position_ms),
            ],
        )?;
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM conversions WHERE job_id = ?1", COLUMNS),
                params![job_id],
                record_from_row,
            )
            .optional()
        })
    }

    fn update_progress(&self, job_id: &str, position_ms: u64) -> Result<(), HistoryError> {
        let conn = self.writer();
        conn.execute(
            "UPDATE conversions SET last_position_ms = ?1 WHERE job_id = ?2 AND status = 'running'",
            params![opt_i64(Some(position_ms)), job_id],
        )?;
        Ok(())
    }

    fn close(
        &self,
        job_id: &str,
        status: HistoryStatus,
        details: &CloseDetails,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, HistoryError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE conversions SET status = ?1, finished_at = ?2, \
                 encode_seconds = COALESCE(?3, encode_seconds), \
                 error = COALESCE(?4, error), \
                 output_path = COALESCE(?5, output_path), \
                 output_size = COALESCE(?6, output_size), \
                 backend = COALESCE(?7, backend) \
             WHERE job_id = ?8 AND status = 'running'",
            params![
                status.as_str(),
                format_timestamp(&finished_at),
                details.encode_seconds,
                details.error,
                details.output_path.as_deref().map(path_text),
                opt_i64(details.output_size),
                details.backend,
                job_id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversions ORDER BY started_at DESC LIMIT ?1",
                COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], record_from_row)?;
            rows.collect()
        })
    }

    fn stats(&self) -> Result<HistoryStats, HistoryError> {
        self.read(|conn| {
            let mut stats = HistoryStats::default();

            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM conversions GROUP BY status")?;
            let counts = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for count in counts {
                let (status, n) = count?;
                if let Some(status) = HistoryStatus::parse(&status) {
                    stats.by_status.insert(status, n.max(0) as u64);
                }
            }

            let (avg, total): (Option<f64>, Option<f64>) = conn.query_row(
                "SELECT AVG(encode_seconds), SUM(encode_seconds) FROM conversions \
                 WHERE status = 'done' AND encode_seconds > 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.avg_encode_seconds = avg;
            stats.total_encode_seconds = total.unwrap_or(0.0);

            let (input, output): (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT SUM(input_size), SUM(output_size) FROM conversions WHERE status = 'done'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.total_input_bytes = opt_u64(input).unwrap_or(0);
            stats.total_output_bytes = opt_u64(output).unwrap_or(0);

            Ok(stats)
        })
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, HistoryError> {
        let conn = self.writer();
        let removed = conn.execute(
            "DELETE FROM conversions WHERE started_at < ?1",
            params![format_timestamp(&cutoff)],
        )?;
        Ok(removed as u64)
    }
}
