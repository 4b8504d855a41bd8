//! Encoder process execution.
//!
//! Spawns the encoder, streams its merged stdout/stderr back line by line
//! (splitting on both `\n` and `\r`, since ffmpeg rewrites its stats line
//! with carriage returns) and kills it when the run is cancelled.

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder process exited with non-zero status
    #[error("encoder failed with exit code {code}{}", format_detail(.detail))]
    Failed { code: i32, detail: Option<String> },

    /// Encoder process was terminated by signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    /// Nothing to run
    #[error("empty encoder command")]
    EmptyCommand,

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_detail(detail: &Option<String>) -> String {
    detail.as_ref().map(|d| format!(": {}", d)).unwrap_or_default()
}

/// How an encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signalled,
    /// Killed because the run was cancelled.
    Cancelled,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited(0))
    }

    /// Convert a non-cancelled exit into a result.
    pub fn into_result(self, last_error: Option<String>) -> Result<(), EncodeError> {
        match self {
            ProcessExit::Exited(0) => Ok(()),
            ProcessExit::Exited(code) => Err(EncodeError::Failed {
                code,
                detail: last_error,
            }),
            ProcessExit::Signalled | ProcessExit::Cancelled => Err(EncodeError::Terminated),
        }
    }
}

/// Runs an encoder command line.
#[async_trait]
pub trait EncoderProcess: Send + Sync {
    /// Run `argv` (program first), calling `on_line` for every output line.
    async fn run(
        &self,
        argv: &[String],
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: &CancellationToken,
    ) -> Result<ProcessExit, EncodeError>;
}

/// [`EncoderProcess`] that spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegProcess;

/// Forward `\r`/`\n` separated segments of `reader` to `tx`.
async fn forward_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Encoder output stream closed with error");
                break;
            }
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    async fn run(
        &self,
        argv: &[String],
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: &CancellationToken,
    ) -> Result<ProcessExit, EncodeError> {
        let (program, args) = argv.split_first().ok_or(EncodeError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill encoder process");
                    }
                    return Ok(ProcessExit::Cancelled);
                }
                line = rx.recv() => match line {
                    Some(line) => on_line(&line),
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill encoder process");
                }
                return Ok(ProcessExit::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(match status.code() {
            Some(code) => ProcessExit::Exited(code),
            None => ProcessExit::Signalled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_exit_into_result() {
        assert!(ProcessExit::Exited(0).into_result(None).is_ok());
        assert!(matches!(
            ProcessExit::Exited(1).into_result(Some("boom".into())),
            Err(EncodeError::Failed { code: 1, detail: Some(_) })
        ));
        assert!(matches!(
            ProcessExit::Signalled.into_result(None),
            Err(EncodeError::Terminated)
        ));
    }

    #[test]
    fn test_failed_message_includes_detail() {
        let err = EncodeError::Failed {
            code: 187,
            detail: Some("Conversion failed!".into()),
        };
        assert_eq!(err.to_string(), "encoder failed with exit code 187: Conversion failed!");
    }

    #[tokio::test]
    async fn test_lines_split_on_cr_and_lf() {
        let mut lines = Vec::new();
        let exit = FfmpegProcess
            .run(
                &sh(r"printf 'frame=1\rframe=2\rframe=3\nfinal\n'; printf 'err line\n' >&2"),
                &mut |line: &str| lines.push(line.to_string()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(exit, ProcessExit::Exited(0));
        for expected in ["frame=1", "frame=2", "frame=3", "final", "err line"] {
            assert!(lines.iter().any(|l| l == expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let exit = FfmpegProcess
            .run(&sh("exit 3"), &mut |_: &str| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Exited(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let exit = FfmpegProcess
            .run(&sh("sleep 30"), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();

        assert_eq!(exit, ProcessExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let result = FfmpegProcess
            .run(&[], &mut |_: &str| {}, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let argv = vec!["/nonexistent/ffmpeg".to_string()];
        let result = FfmpegProcess
            .run(&argv, &mut |_: &str| {}, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeError::Io(_))));
    }
}
