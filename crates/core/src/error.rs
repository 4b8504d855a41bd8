//! Job and run level errors.

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::history::HistoryError;
use crate::integrity::IntegrityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable tag for a job failure, usable in logs and history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProbeFailed,
    BackendUnavailable,
    EncodeProcessFailed,
    DiskQuotaExceeded,
    IntegrityCheckFailed,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProbeFailed => "probe_failed",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::EncodeProcessFailed => "encode_process_failed",
            ErrorKind::DiskQuotaExceeded => "disk_quota_exceeded",
            ErrorKind::IntegrityCheckFailed => "integrity_check_failed",
            ErrorKind::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single job did not finish successfully.
///
/// Confined to its job: the run carries on with the other inputs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error(transparent)]
    BackendUnavailable(#[from] BackendError),

    #[error("{0}")]
    EncodeProcessFailed(String),

    #[error("disk guard: {0}")]
    DiskQuotaExceeded(String),

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(#[from] IntegrityError),

    #[error("interrupted")]
    Interrupted,
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::ProbeFailed(_) => ErrorKind::ProbeFailed,
            JobError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            JobError::EncodeProcessFailed(_) => ErrorKind::EncodeProcessFailed,
            JobError::DiskQuotaExceeded(_) => ErrorKind::DiskQuotaExceeded,
            JobError::IntegrityCheckFailed(_) => ErrorKind::IntegrityCheckFailed,
            JobError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

/// Errors that stop a run before any job is created.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("History store unavailable: {0}")]
    History(#[from] HistoryError),
}
