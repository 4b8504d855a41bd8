//! Append-only JSONL history store.
//!
//! Every write appends one full record snapshot. Reading merges lines by job
//! id: before a record is closed the latest line wins, after that the first
//! closing line wins and later lines for the same id are ignored. Lines that
//! fail to parse (a torn write after a crash) are skipped.

use super::{CloseDetails, HistoryError, HistoryRecord, HistoryStats, HistoryStatus, HistoryStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct JsonlHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlHistoryStore {
    /// Open the file at `path`, creating it when missing.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        // Terminate a torn tail so this record starts on its own line.
        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                line.insert(0, '\n');
            }
        }
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Merged view of the file, in first-seen order.
    fn load(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut order: Vec<String> = Vec::new();
        let mut merged: HashMap<String, HistoryRecord> = HashMap::new();

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: HistoryRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    debug!(line = lineno + 1, error = %e, "Skipping unreadable history line");
                    continue;
                }
            };
            match merged.get(&record.job_id) {
                Some(existing) if existing.status.is_closed() => {}
                Some(_) => {
                    merged.insert(record.job_id.clone(), record);
                }
                None => {
                    order.push(record.job_id.clone());
                    merged.insert(record.job_id.clone(), record);
                }
            }
        }

        Ok(order.into_iter().filter_map(|id| merged.remove(&id)).collect())
    }

    fn find(&self, job_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(self.load()?.into_iter().find(|r| r.job_id == job_id))
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn engine(&self) -> &'static str {
        "jsonl"
    }

    fn insert(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let _guard = self.guard();
        if self.find(&record.job_id)?.is_some() {
            return Ok(());
        }
        self.append(record)
    }

    fn get(&self, job_id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        self.find(job_id)
    }

    fn update_progress(&self, job_id: &str, position_ms: u64) -> Result<(), HistoryError> {
        let _guard = self.guard();
        match self.find(job_id)? {
            Some(mut record) if !record.status.is_closed() => {
                record.last_position_ms = Some(position_ms);
                self.append(&record)
            }
            _ => Ok(()),
        }
    }

    fn close(
        &self,
        job_id: &str,
        status: HistoryStatus,
        details: &CloseDetails,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, HistoryError> {
        let _guard = self.guard();
        match self.find(job_id)? {
            Some(mut record) if !record.status.is_closed() => {
                record.apply_close(status, details, finished_at);
                self.append(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut records = self.load()?;
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }

    fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let mut stats = HistoryStats::default();
        let mut timed = 0u64;

        for record in self.load()? {
            *stats.by_status.entry(record.status).or_insert(0) += 1;
            if record.status != HistoryStatus::Done {
                continue;
            }
            if let Some(secs) = record.encode_seconds.filter(|s| *s > 0.0) {
                stats.total_encode_seconds += secs;
                timed += 1;
            }
            stats.total_input_bytes += record.input_size.unwrap_or(0);
            stats.total_output_bytes += record.output_size.unwrap_or(0);
        }

        if timed > 0 {
            stats.avg_encode_seconds = Some(stats.total_encode_seconds / timed as f64);
        }
        Ok(stats)
    }

    /// Rewrites the file with the merged records that are kept.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, HistoryError> {
        let _guard = self.guard();
        let records = self.load()?;
        let before = records.len();
        let kept: Vec<HistoryRecord> = records.into_iter().filter(|r| r.started_at >= cutoff).collect();
        let removed = (before - kept.len()) as u64;
        if removed == 0 {
            return Ok(0);
        }

        let mut staging = self.path.as_os_str().to_owned();
        staging.push(".rewrite");
        let staging = PathBuf::from(staging);
        {
            let mut file = File::create(&staging)?;
            for record in &kept {
                serde_json::to_writer(&mut file, record)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&staging, &self.path)?;
        Ok(removed)
    }
}
