//! Conversion history.
//!
//! Durable, crash-safe lifecycle records: a record is opened when a job
//! starts, updated with the last progress position, and closed exactly once
//! with its terminal status. Closed records are never changed again.
//!
//! Two storage engines implement [`HistoryStore`]: SQLite (primary) and an
//! append-only JSONL file used when SQLite cannot be opened.

mod jsonl;
mod sqlite;

pub use jsonl::JsonlHistoryStore;
pub use sqlite::SqliteHistoryStore;

use crate::backend::Backend;
use crate::config::HistoryEngine;
use crate::job::Job;
use crate::progress::ProgressSnapshot;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// SQLite database file name inside the state directory.
pub const SQLITE_FILE: &str = "history.db";
/// JSONL file name inside the state directory.
pub const JSONL_FILE: &str = "history.jsonl";

/// Minimum spacing between persisted progress updates of one job.
const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from history storage.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for HistoryError {
    fn from(e: rusqlite::Error) -> Self {
        HistoryError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(e: serde_json::Error) -> Self {
        HistoryError::Serialization(e.to_string())
    }
}

/// Lifecycle status of a history record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Running,
    Done,
    Skipped,
    Failed,
    Interrupted,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Running => "running",
            HistoryStatus::Done => "done",
            HistoryStatus::Skipped => "skipped",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(HistoryStatus::Running),
            "done" => Some(HistoryStatus::Done),
            "skipped" => Some(HistoryStatus::Skipped),
            "failed" => Some(HistoryStatus::Failed),
            "interrupted" => Some(HistoryStatus::Interrupted),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self != HistoryStatus::Running
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversion attempt of one input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub encode_seconds: Option<f64>,
    pub backend: Option<String>,
    pub error: Option<String>,
    pub input_size: Option<u64>,
    pub output_size: Option<u64>,
    pub last_position_ms: Option<u64>,
}

impl HistoryRecord {
    /// A new running record.
    pub fn running(job_id: impl Into<String>, input_path: impl Into<PathBuf>, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            input_path: input_path.into(),
            output_path: None,
            status: HistoryStatus::Running,
            started_at,
            finished_at: None,
            encode_seconds: None,
            backend: None,
            error: None,
            input_size: None,
            output_size: None,
            last_position_ms: None,
        }
    }

    /// Apply a close to this record in memory.
    pub fn apply_close(&mut self, status: HistoryStatus, details: &CloseDetails, finished_at: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(finished_at);
        if details.output_path.is_some() {
            self.output_path = details.output_path.clone();
        }
        if details.encode_seconds.is_some() {
            self.encode_seconds = details.encode_seconds;
        }
        if details.error.is_some() {
            self.error = details.error.clone();
        }
        if details.output_size.is_some() {
            self.output_size = details.output_size;
        }
        if details.backend.is_some() {
            self.backend = details.backend.clone();
        }
    }
}

/// Terminal facts recorded when a record is closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseDetails {
    pub output_path: Option<PathBuf>,
    pub encode_seconds: Option<f64>,
    pub error: Option<String>,
    pub output_size: Option<u64>,
    pub backend: Option<String>,
}

/// Aggregate figures over all records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub by_status: HashMap<HistoryStatus, u64>,
    /// Average encode time of `done` records with a positive duration.
    pub avg_encode_seconds: Option<f64>,
    pub total_encode_seconds: f64,
    /// Input bytes of `done` records.
    pub total_input_bytes: u64,
    /// Output bytes of `done` records.
    pub total_output_bytes: u64,
}

impl HistoryStats {
    pub fn count(&self, status: HistoryStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Storage engine for history records.
///
/// Implementations must make `close` affect only running records, so a
/// record is closed at most once.
pub trait HistoryStore: Send + Sync {
    /// Engine name for logs.
    fn engine(&self) -> &'static str;

    fn insert(&self, record: &HistoryRecord) -> Result<(), HistoryError>;

    fn get(&self, job_id: &str) -> Result<Option<HistoryRecord>, HistoryError>;

    /// Record the last progress position of a running record.
    fn update_progress(&self, job_id: &str, position_ms: u64) -> Result<(), HistoryError>;

    /// Close a running record.
    ///
    /// # Returns
    /// `true` when a running record was closed, `false` when none matched.
    fn close(
        &self,
        job_id: &str,
        status: HistoryStatus,
        details: &CloseDetails,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, HistoryError>;

    /// Most recently started records first.
    fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError>;

    fn stats(&self) -> Result<HistoryStats, HistoryError>;

    /// Delete records started before `cutoff`; returns how many were removed.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, HistoryError>;
}

/// Timestamp format shared by both engines; sorts lexicographically.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Open the store for `engine` inside `state_dir`, creating the directory.
///
/// `auto` tries SQLite first and falls back to JSONL with a warning.
pub fn open_store(engine: HistoryEngine, state_dir: &Path) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    std::fs::create_dir_all(state_dir)?;
    let sqlite_path = state_dir.join(SQLITE_FILE);
    let jsonl_path = state_dir.join(JSONL_FILE);

    match engine {
        HistoryEngine::Sqlite => Ok(Arc::new(SqliteHistoryStore::open(&sqlite_path)?)),
        HistoryEngine::Jsonl => Ok(Arc::new(JsonlHistoryStore::open(&jsonl_path)?)),
        HistoryEngine::Auto => match SqliteHistoryStore::open(&sqlite_path) {
            Ok(store) => Ok(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, path = %sqlite_path.display(), "SQLite history unavailable, using JSONL");
                Ok(Arc::new(JsonlHistoryStore::open(&jsonl_path)?))
            }
        },
    }
}

/// Job lifecycle bookkeeping on top of a [`HistoryStore`].
///
/// Writes are serialized by one writer lock; reads go straight to the store.
pub struct HistoryTracker {
    store: Arc<dyn HistoryStore>,
    writer: Mutex<HashMap<String, Instant>>,
}

impl HistoryTracker {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            writer: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &'static str {
        self.store.engine()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a running record for `job`.
    pub fn open(&self, job: &Job) -> Result<(), HistoryError> {
        let _guard = self.lock();
        if self.store.get(&job.id.to_string())?.is_some() {
            return Ok(());
        }
        let mut record = HistoryRecord::running(job.id.to_string(), &job.input, job.started_at.unwrap_or_else(Utc::now));
        record.input_size = job.input_size;
        record.backend = job.backend.map(|b: Backend| b.to_string());
        self.store.insert(&record)
    }

    /// Persist the last progress position, at most once per interval per job.
    pub fn update(&self, job: &Job, snapshot: &ProgressSnapshot) -> Result<(), HistoryError> {
        let mut last_write = self.lock();
        let key = job.id.to_string();
        let due = last_write
            .get(&key)
            .map(|at| at.elapsed() >= PROGRESS_PERSIST_INTERVAL)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        last_write.insert(key.clone(), Instant::now());
        self.store.update_progress(&key, snapshot.current_time_ms)
    }

    /// Close the record for `job`.
    ///
    /// Idempotent: closing an already closed record changes nothing. Closing a
    /// job that was never opened inserts a record that is already closed.
    pub fn close(&self, job: &Job, status: HistoryStatus, details: CloseDetails) -> Result<(), HistoryError> {
        let mut last_write = self.lock();
        let key = job.id.to_string();
        last_write.remove(&key);
        let now = Utc::now();

        match self.store.get(&key)? {
            Some(existing) if existing.status.is_closed() => Ok(()),
            Some(_) => self.store.close(&key, status, &details, now).map(|_| ()),
            None => {
                let mut record = HistoryRecord::running(key, &job.input, job.started_at.unwrap_or(now));
                record.input_size = job.input_size;
                record.backend = job.backend.map(|b| b.to_string());
                record.apply_close(status, &details, now);
                self.store.insert(&record)
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        self.store.recent(limit)
    }

    pub fn stats(&self) -> Result<HistoryStats, HistoryError> {
        self.store.stats()
    }

    /// Remove records started more than `days` days ago.
    pub fn prune_older_than(&self, days: u32) -> Result<u64, HistoryError> {
        let _guard = self.lock();
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        self.store.prune_before(cutoff)
    }
}

/// Shared contract tests run against both engines.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;

    fn closed_details(output: &str) -> CloseDetails {
        CloseDetails {
            output_path: Some(PathBuf::from(output)),
            encode_seconds: Some(12.5),
            error: None,
            output_size: Some(400),
            backend: Some("cpu".to_string()),
        }
    }

    pub fn insert_close_get(store: &dyn HistoryStore) {
        let started = Utc::now();
        let mut record = HistoryRecord::running("job-1", "/in/a.mkv", started);
        record.input_size = Some(1_000);
        store.insert(&record).unwrap();

        store.update_progress("job-1", 42_000).unwrap();
        let running = store.get("job-1").unwrap().unwrap();
        assert_eq!(running.status, HistoryStatus::Running);
        assert_eq!(running.last_position_ms, Some(42_000));

        let closed = store
            .close("job-1", HistoryStatus::Done, &closed_details("/in/a.cast.mkv"), Utc::now())
            .unwrap();
        assert!(closed);

        let record = store.get("job-1").unwrap().unwrap();
        assert_eq!(record.status, HistoryStatus::Done);
        assert_eq!(record.output_path, Some(PathBuf::from("/in/a.cast.mkv")));
        assert_eq!(record.output_size, Some(400));
        assert!(record.finished_at.is_some());
        assert!(store.get("missing").unwrap().is_none());
    }

    pub fn second_close_is_noop(store: &dyn HistoryStore) {
        store
            .insert(&HistoryRecord::running("job-2", "/in/b.mkv", Utc::now()))
            .unwrap();
        assert!(store
            .close("job-2", HistoryStatus::Failed, &CloseDetails::default(), Utc::now())
            .unwrap());
        assert!(!store
            .close("job-2", HistoryStatus::Done, &closed_details("/x"), Utc::now())
            .unwrap());
        store.update_progress("job-2", 99).unwrap();

        let record = store.get("job-2").unwrap().unwrap();
        assert_eq!(record.status, HistoryStatus::Failed);
        assert_eq!(record.output_path, None);
        assert_eq!(record.last_position_ms, None);
    }

    pub fn recent_and_stats(store: &dyn HistoryStore) {
        let base = Utc::now() - ChronoDuration::hours(1);
        for (i, status) in [HistoryStatus::Done, HistoryStatus::Done, HistoryStatus::Skipped, HistoryStatus::Failed]
            .into_iter()
            .enumerate()
        {
            let id = format!("job-{}", i);
            let mut record = HistoryRecord::running(&id, format!("/in/{}.mkv", i), base + ChronoDuration::minutes(i as i64));
            record.input_size = Some(1_000);
            store.insert(&record).unwrap();
            let details = CloseDetails {
                encode_seconds: Some(10.0 * (i as f64 + 1.0)),
                output_size: Some(500),
                ..CloseDetails::default()
            };
            store.close(&id, status, &details, Utc::now()).unwrap();
        }
        store
            .insert(&HistoryRecord::running("job-running", "/in/r.mkv", base + ChronoDuration::minutes(10)))
            .unwrap();

        let recent = store.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].job_id, "job-running");
        assert_eq!(recent[1].job_id, "job-3");

        let stats = store.stats().unwrap();
        assert_eq!(stats.count(HistoryStatus::Done), 2);
        assert_eq!(stats.count(HistoryStatus::Skipped), 1);
        assert_eq!(stats.count(HistoryStatus::Failed), 1);
        assert_eq!(stats.count(HistoryStatus::Running), 1);
        assert_eq!(stats.count(HistoryStatus::Interrupted), 0);
        assert_eq!(stats.total_encode_seconds, 30.0);
        assert_eq!(stats.avg_encode_seconds, Some(15.0));
        assert_eq!(stats.total_input_bytes, 2_000);
        assert_eq!(stats.total_output_bytes, 1_000);
    }

    pub fn prune(store: &dyn HistoryStore) {
        let old = Utc::now() - ChronoDuration::days(40);
        store.insert(&HistoryRecord::running("old", "/in/old.mkv", old)).unwrap();
        store.insert(&HistoryRecord::running("new", "/in/new.mkv", Utc::now())).unwrap();

        let removed = store.prune_before(Utc::now() - ChronoDuration::days(30)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("new").unwrap().is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job(name: &str) -> Job {
        Job::new(PathBuf::from(format!("/media/{}.mkv", name)))
    }

    fn tracker(dir: &Path, engine: HistoryEngine) -> HistoryTracker {
        HistoryTracker::new(open_store(engine, dir).unwrap())
    }

    #[test]
    fn test_open_store_engines() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(open_store(HistoryEngine::Auto, dir.path()).unwrap().engine(), "sqlite");
        assert_eq!(open_store(HistoryEngine::Jsonl, dir.path()).unwrap().engine(), "jsonl");
        assert!(dir.path().join(SQLITE_FILE).exists());
    }

    #[test]
    fn test_auto_falls_back_to_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the database file should be makes SQLite fail to open.
        std::fs::create_dir_all(dir.path().join(SQLITE_FILE)).unwrap();

        let store = open_store(HistoryEngine::Auto, dir.path()).unwrap();
        assert_eq!(store.engine(), "jsonl");
    }

    #[test]
    fn test_close_twice_keeps_first_status() {
        for engine in [HistoryEngine::Sqlite, HistoryEngine::Jsonl] {
            let dir = tempfile::tempdir().unwrap();
            let tracker = tracker(dir.path(), engine);
            let job = job("movie");

            tracker.open(&job).unwrap();
            tracker
                .close(&job, HistoryStatus::Done, CloseDetails::default())
                .unwrap();
            tracker
                .close(&job, HistoryStatus::Failed, CloseDetails::default())
                .unwrap();

            let records = tracker.recent(10).unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].status, HistoryStatus::Done);
        }
    }

    #[test]
    fn test_close_without_open_inserts_closed_record() {
        for engine in [HistoryEngine::Sqlite, HistoryEngine::Jsonl] {
            let dir = tempfile::tempdir().unwrap();
            let tracker = tracker(dir.path(), engine);
            let job = job("queued");

            tracker
                .close(
                    &job,
                    HistoryStatus::Interrupted,
                    CloseDetails {
                        error: Some("interrupted before start".into()),
                        ..CloseDetails::default()
                    },
                )
                .unwrap();

            let records = tracker.recent(10).unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].status, HistoryStatus::Interrupted);
            assert!(records[0].finished_at.is_some());
            assert_eq!(tracker.stats().unwrap().count(HistoryStatus::Interrupted), 1);
        }
    }

    #[test]
    fn test_update_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), HistoryEngine::Sqlite);
        let job = job("progress");
        tracker.open(&job).unwrap();

        let mut snapshot = ProgressSnapshot::new(crate::progress::Stage::Transcode, Some(100_000));
        snapshot.current_time_ms = 1_000;
        tracker.update(&job, &snapshot).unwrap();
        snapshot.current_time_ms = 2_000;
        tracker.update(&job, &snapshot).unwrap();

        let record = tracker.recent(1).unwrap().remove(0);
        assert_eq!(record.last_position_ms, Some(1_000));
    }

    #[test]
    fn test_prune_older_than_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), HistoryEngine::Sqlite);
        let job = job("fresh");
        tracker.open(&job).unwrap();

        assert_eq!(tracker.prune_older_than(30).unwrap(), 0);
        assert_eq!(tracker.recent(10).unwrap().len(), 1);
    }
}
