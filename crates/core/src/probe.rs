//! Probe module for reading stream metadata from media files.
//!
//! Runs ffprobe, parses its JSON output into [`StreamInfo`] and exposes the
//! [`Prober`] trait so the pipeline can be driven without ffprobe installed.

use crate::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Default upper bound for a single ffprobe run.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe did not finish in time.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a container stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Attachment,
    #[default]
    Other,
}

impl StreamKind {
    fn from_codec_type(codec_type: &str) -> Self {
        match codec_type {
            "video" => StreamKind::Video,
            "audio" => StreamKind::Audio,
            "subtitle" => StreamKind::Subtitle,
            "attachment" => StreamKind::Attachment,
            _ => StreamKind::Other,
        }
    }
}

/// One stream as reported by ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamDescriptor {
    /// Absolute stream index in the container.
    pub index: usize,
    pub kind: StreamKind,
    /// Codec name (e.g. "h264", "hevc", "aac").
    pub codec: String,
    pub profile: Option<String>,
    /// Codec level as reported by ffprobe (41 = 4.1); 0 or absent when unknown.
    pub level: Option<i32>,
    pub pixel_format: Option<String>,
    /// ISO 639 language tag, lowercased.
    pub language: Option<String>,
    pub title: Option<String>,
    pub channels: Option<u32>,
    /// BT.2020 primaries or a PQ/HLG transfer function.
    pub hdr: bool,
    pub forced: bool,
    pub hearing_impaired: bool,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamInfo {
    /// Container duration in milliseconds, when known.
    pub duration_ms: Option<u64>,
    pub format_name: String,
    pub size_bytes: u64,
    /// Streams in container order.
    pub streams: Vec<StreamDescriptor>,
}

impl StreamInfo {
    /// Iterates over streams of the given kind, in container order.
    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<usize>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub profile: Option<String>,
        pub level: Option<i32>,
        pub pix_fmt: Option<String>,
        pub channels: Option<u32>,
        pub color_transfer: Option<String>,
        pub color_primaries: Option<String>,
        pub tags: Option<HashMap<String, String>>,
        pub disposition: Option<HashMap<String, i64>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Source of stream metadata.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<StreamInfo, ProbeError>;
}

/// [`Prober`] backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Prober using `[encoding] ffprobe_path` and `ffprobe_timeout_secs`.
    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.encoding.ffprobe_path.clone())
            .with_timeout(Duration::from_secs(cfg.encoding.ffprobe_timeout_secs))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
    /// and parses the JSON output.
    async fn probe(&self, path: &Path) -> Result<StreamInfo, ProbeError> {
        let child = Command::new(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

fn is_hdr(transfer: Option<&str>, primaries: Option<&str>) -> bool {
    let transfer = transfer.unwrap_or("").to_lowercase();
    let primaries = primaries.unwrap_or("").to_lowercase();
    transfer == "smpte2084" || transfer == "arib-std-b67" || primaries.starts_with("bt2020")
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != "und")
        .map(str::to_string)
}

/// Parses ffprobe JSON output into a [`StreamInfo`].
pub fn parse_ffprobe_output(json_str: &str) -> Result<StreamInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let streams = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, stream)| {
            let tags = stream.tags.unwrap_or_default();
            let disposition = stream.disposition.unwrap_or_default();
            let flag = |key: &str| disposition.get(key).copied().unwrap_or(0) != 0;

            StreamDescriptor {
                index: stream.index.unwrap_or(position),
                kind: StreamKind::from_codec_type(stream.codec_type.as_deref().unwrap_or("")),
                codec: stream.codec_name.unwrap_or_default().to_lowercase(),
                hdr: is_hdr(
                    stream.color_transfer.as_deref(),
                    stream.color_primaries.as_deref(),
                ),
                profile: stream.profile,
                level: stream.level,
                pixel_format: stream.pix_fmt,
                language: non_empty(tags.get("language")).map(|l| l.to_lowercase()),
                title: tags.get("title").map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
                channels: stream.channels,
                forced: flag("forced"),
                hearing_impaired: flag("hearing_impaired"),
            }
        })
        .collect();

    let duration_ms = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| (d * 1000.0).round() as u64);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(StreamInfo {
        duration_ms,
        format_name: format.format_name.unwrap_or_default(),
        size_bytes,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "hevc",
                "codec_type": "video",
                "profile": "Main 10",
                "level": 150,
                "pix_fmt": "yuv420p10le",
                "color_transfer": "smpte2084",
                "color_primaries": "bt2020"
            },
            {
                "index": 1,
                "codec_name": "eac3",
                "codec_type": "audio",
                "channels": 6,
                "tags": {"language": "FRE", "title": "VFF"},
                "disposition": {"default": 1, "forced": 0}
            },
            {
                "index": 2,
                "codec_name": "subrip",
                "codec_type": "subtitle",
                "tags": {"language": "eng"},
                "disposition": {"forced": 1, "hearing_impaired": 0}
            },
            {
                "index": 3,
                "codec_name": "ttf",
                "codec_type": "attachment",
                "tags": {"language": "und"}
            }
        ],
        "format": {
            "format_name": "matroska,webm",
            "duration": "5400.250000",
            "size": "4000000000"
        }
    }"#;

    #[test]
    fn test_parse_ffprobe_output_full() {
        let info = parse_ffprobe_output(SAMPLE).expect("sample should parse");

        assert_eq!(info.duration_ms, Some(5_400_250));
        assert_eq!(info.format_name, "matroska,webm");
        assert_eq!(info.size_bytes, 4_000_000_000);
        assert_eq!(info.streams.len(), 4);

        let video = &info.streams[0];
        assert_eq!(video.kind, StreamKind::Video);
        assert_eq!(video.codec, "hevc");
        assert_eq!(video.profile.as_deref(), Some("Main 10"));
        assert!(video.hdr);

        let audio = &info.streams[1];
        assert_eq!(audio.kind, StreamKind::Audio);
        assert_eq!(audio.language.as_deref(), Some("fre"));
        assert_eq!(audio.title.as_deref(), Some("VFF"));
        assert_eq!(audio.channels, Some(6));
        assert!(!audio.forced);

        let sub = &info.streams[2];
        assert_eq!(sub.kind, StreamKind::Subtitle);
        assert!(sub.forced);
        assert!(!sub.hearing_impaired);

        let attachment = &info.streams[3];
        assert_eq!(attachment.kind, StreamKind::Attachment);
        assert_eq!(attachment.language, None);
    }

    #[test]
    fn test_parse_missing_duration_is_unknown() {
        let json = r#"{"streams": [], "format": {"duration": "N/A"}}"#;
        let info = parse_ffprobe_output(json).expect("should parse");
        assert_eq!(info.duration_ms, None);
        assert_eq!(info.size_bytes, 0);
    }

    #[test]
    fn test_parse_missing_format_is_error() {
        let json = r#"{"streams": []}"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_invalid_json_is_error() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_streams_of_filters_by_kind() {
        let info = parse_ffprobe_output(SAMPLE).expect("sample should parse");
        assert_eq!(info.streams_of(StreamKind::Audio).count(), 1);
        assert_eq!(info.streams_of(StreamKind::Video).count(), 1);
        assert_eq!(info.streams_of(StreamKind::Other).count(), 0);
    }

    #[test]
    fn test_hlg_is_hdr_and_bt709_is_not() {
        assert!(is_hdr(Some("arib-std-b67"), Some("bt709")));
        assert!(!is_hdr(Some("bt709"), Some("bt709")));
        assert!(!is_hdr(None, None));
    }

    #[test]
    fn test_from_config_uses_configured_timeout() {
        let mut cfg = Config::default();
        cfg.encoding.ffprobe_timeout_secs = 12;
        assert_eq!(FfprobeProber::from_config(&cfg).timeout(), Duration::from_secs(12));
        assert_eq!(FfprobeProber::default().timeout(), DEFAULT_PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let prober = FfprobeProber::new("/nonexistent/ffprobe-binary");
        let result = prober.probe(Path::new("/tmp/whatever.mkv")).await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }
}
