//! Source file verification run before a file is probed and encoded.
//!
//! Checks, in order: minimum size, size stability, and an optional full
//! decode of the first video stream.

use crate::command::deep_check_args;
use crate::config::{Config, IntegrityConfig};
use crate::stability::{wait_for_stable, StabilityResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error type for integrity checks.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("file too small ({size} bytes < {min} bytes)")]
    TooSmall { size: u64, min: u64 },

    #[error("file still being written ({initial_size} -> {current_size} bytes)")]
    Unstable { initial_size: u64, current_size: u64 },

    #[error("decode check failed: {0}")]
    DecodeFailed(String),

    #[error("decode check timed out after {0:?}")]
    Timeout(Duration),

    #[error("integrity check cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verifies that a source file is complete and readable.
#[async_trait]
pub trait IntegrityChecker: Send + Sync {
    async fn verify(&self, path: &Path, cancel: &CancellationToken) -> Result<(), IntegrityError>;
}

/// Filesystem and ffmpeg backed [`IntegrityChecker`].
#[derive(Debug, Clone)]
pub struct FileIntegrityChecker {
    config: Config,
}

impl FileIntegrityChecker {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn settings(&self) -> &IntegrityConfig {
        &self.config.integrity
    }

    async fn deep_check(&self, path: &Path, cancel: &CancellationToken) -> Result<(), IntegrityError> {
        let argv = deep_check_args(path, &self.config);
        let Some((program, args)) = argv.split_first() else {
            return Err(IntegrityError::DecodeFailed("empty command".to_string()));
        };
        let timeout = Duration::from_secs(self.settings().deep_check_timeout_secs);

        let child = Command::new(PathBuf::from(program))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the wait future on timeout or cancel kills the child.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(IntegrityError::Cancelled),
            res = tokio::time::timeout(timeout, child.wait_with_output()) => {
                res.map_err(|_| IntegrityError::Timeout(timeout))??
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() && stderr.trim().is_empty() {
            Ok(())
        } else {
            let first_error = stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("decoder exited with an error");
            Err(IntegrityError::DecodeFailed(first_error.trim().to_string()))
        }
    }
}

#[async_trait]
impl IntegrityChecker for FileIntegrityChecker {
    async fn verify(&self, path: &Path, cancel: &CancellationToken) -> Result<(), IntegrityError> {
        let size = tokio::fs::metadata(path).await?.len();
        check_min_size(size, self.settings().min_size_bytes)?;

        if !self.settings().enabled {
            return Ok(());
        }

        let wait = Duration::from_secs(self.settings().stable_wait_secs);
        match wait_for_stable(path, wait, self.settings().stable_retries, cancel).await? {
            StabilityResult::Stable => {}
            StabilityResult::Unstable {
                initial_size,
                current_size,
            } => {
                return Err(IntegrityError::Unstable {
                    initial_size,
                    current_size,
                })
            }
            StabilityResult::Cancelled => return Err(IntegrityError::Cancelled),
        }

        if self.settings().deep_check {
            debug!(path = %path.display(), "Running deep decode check");
            self.deep_check(path, cancel).await?;
        }
        Ok(())
    }
}

/// Reject files below the configured minimum size.
pub fn check_min_size(size: u64, min: u64) -> Result<(), IntegrityError> {
    if size < min {
        Err(IntegrityError::TooSmall { size, min })
    } else {
        Ok(())
    }
}
