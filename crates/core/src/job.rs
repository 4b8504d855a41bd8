//! Per-input job state.

use crate::backend::Backend;
use crate::decision::Decision;
use crate::error::ErrorKind;
use crate::history::HistoryStatus;
use crate::progress::ProgressSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Where a job is in the pipeline.
///
/// `Queued → Checking → {Skipped | Failed | Encoding} → {Done | Failed}`,
/// plus `Interrupted` from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Checking,
    Encoding,
    Done,
    Skipped,
    Failed,
    Interrupted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Checking => "checking",
            JobState::Encoding => "encoding",
            JobState::Done => "done",
            JobState::Skipped => "skipped",
            JobState::Failed => "failed",
            JobState::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Skipped | JobState::Failed | JobState::Interrupted
        )
    }

    /// History status for a terminal state; `None` while the job is live.
    pub fn history_status(&self) -> Option<HistoryStatus> {
        match self {
            JobState::Done => Some(HistoryStatus::Done),
            JobState::Skipped => Some(HistoryStatus::Skipped),
            JobState::Failed => Some(HistoryStatus::Failed),
            JobState::Interrupted => Some(HistoryStatus::Interrupted),
            JobState::Queued | JobState::Checking | JobState::Encoding => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One input file moving through a run.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub input: PathBuf,
    /// Final output path, known once the decision is made.
    pub output: Option<PathBuf>,
    /// Path the encoder writes to before promotion.
    pub temp: Option<PathBuf>,
    pub state: JobState,
    pub decision: Option<Decision>,
    pub backend: Option<Backend>,
    pub input_size: Option<u64>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Option<ProgressSnapshot>,
    pub attempts: u32,
}

impl Job {
    pub fn new(input: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            input,
            output: None,
            temp: None,
            state: JobState::Queued,
            decision: None,
            backend: None,
            input_size: None,
            duration_ms: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: None,
            attempts: 0,
        }
    }
}

/// Outcome of one job, reported once per input.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: Uuid,
    pub input: PathBuf,
    /// Set only when the output file was written.
    pub output: Option<PathBuf>,
    pub state: JobState,
    pub backend: Option<Backend>,
    pub error: Option<ErrorKind>,
    /// Human readable reason for the terminal state.
    pub reason: String,
    pub attempts: u32,
}
