//! Startup checks module for mkv2cast
//!
//! Preflight checks run before a conversion: the configured ffmpeg and
//! ffprobe binaries must start and report a version.

use crate::config::Config;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Time allowed for `-version` calls.
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// A required external tool failed to start.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// Versions reported by the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    /// First line of `ffmpeg -version`.
    pub ffmpeg: String,
    /// Major version parsed from the ffmpeg banner, when recognisable.
    pub ffmpeg_major: Option<u32>,
    /// First line of `ffprobe -version`.
    pub ffprobe: String,
}

/// Major version from an `ffmpeg -version` banner.
///
/// Release builds print `ffmpeg version 6.1.1`, distribution snapshots
/// `ffmpeg version n7.0-12-gabcdef`. Git-date builds carry no number.
pub fn parse_ffmpeg_version(banner: &str) -> Option<u32> {
    const MARKER: &str = "ffmpeg version ";
    banner.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let token = lower[lower.find(MARKER)? + MARKER.len()..].split_whitespace().next()?;
        let digits: String = token
            .strip_prefix('n')
            .unwrap_or(token)
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    })
}

/// Run `<binary> -version` and return the first output line.
async fn version_line(binary: &Path) -> Result<String, String> {
    let child = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to run {} -version: {}", binary.display(), e))?;

    let output = tokio::time::timeout(VERSION_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| format!("{} -version timed out", binary.display()))?
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", binary.display(), output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("").trim().to_string())
}

/// Verify that ffmpeg and ffprobe run, and report their versions.
pub async fn check_requirements(cfg: &Config) -> Result<ToolVersions, StartupError> {
    let ffmpeg = version_line(&cfg.encoding.ffmpeg_path)
        .await
        .map_err(StartupError::FfmpegUnavailable)?;
    let ffprobe = version_line(&cfg.encoding.ffprobe_path)
        .await
        .map_err(StartupError::FfprobeUnavailable)?;

    let versions = ToolVersions {
        ffmpeg_major: parse_ffmpeg_version(&ffmpeg),
        ffmpeg,
        ffprobe,
    };
    info!(ffmpeg = %versions.ffmpeg, ffprobe = %versions.ffprobe, "External tools found");
    Ok(versions)
}
