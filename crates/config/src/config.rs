//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound for any explicit worker count.
pub const MAX_WORKERS: u32 = 64;

/// Highest CRF value accepted by x264.
pub const MAX_CRF: u8 = 51;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error (also covers unknown container/backend names)
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Output container format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mkv,
    Mp4,
}

impl Container {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "mkv" => Some(Container::Mkv),
            "mp4" => Some(Container::Mp4),
            _ => None,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Requested encoder backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HwChoice {
    /// Probe hardware backends in priority order and fall back to CPU.
    #[default]
    Auto,
    Nvenc,
    Amf,
    Qsv,
    Vaapi,
    Cpu,
}

impl HwChoice {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "auto" => Some(HwChoice::Auto),
            "nvenc" => Some(HwChoice::Nvenc),
            "amf" => Some(HwChoice::Amf),
            "qsv" => Some(HwChoice::Qsv),
            "vaapi" => Some(HwChoice::Vaapi),
            "cpu" => Some(HwChoice::Cpu),
            _ => None,
        }
    }
}

/// Named quality profile; explicit `[encoding]` values override it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityProfile {
    Fast,
    #[default]
    Balanced,
    Quality,
}

impl QualityProfile {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "fast" => Some(QualityProfile::Fast),
            "balanced" => Some(QualityProfile::Balanced),
            "quality" => Some(QualityProfile::Quality),
            _ => None,
        }
    }
}

/// Storage engine for the conversion history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryEngine {
    /// SQLite when it can be opened, JSONL otherwise.
    #[default]
    Auto,
    Sqlite,
    Jsonl,
}

/// Output naming and artifact handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Suffix inserted before the container extension (default ".cast")
    pub suffix: String,
    pub container: Container,
    /// Write outputs here instead of next to the input
    pub output_dir: Option<PathBuf>,
    /// Partial outputs are moved here on failure or interruption; deleted when unset
    pub discard_dir: Option<PathBuf>,
    /// Skip files whose streams are already compatible
    pub skip_when_ok: bool,
    /// Build commands without running them
    pub dry_run: bool,
    pub preserve_metadata: bool,
    pub preserve_chapters: bool,
    /// Copy font/attachment streams (MKV only)
    pub preserve_attachments: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            suffix: ".cast".to_string(),
            container: Container::Mkv,
            output_dir: None,
            discard_dir: None,
            skip_when_ok: true,
            dry_run: false,
            preserve_metadata: true,
            preserve_chapters: true,
            preserve_attachments: false,
        }
    }
}

/// Codec forcing flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CodecConfig {
    pub force_h264: bool,
    pub allow_hevc: bool,
    pub force_aac: bool,
    /// Keep multichannel audio and accept AC-3/E-AC-3 as-is
    pub keep_surround: bool,
    pub add_silence_if_no_audio: bool,
}

/// Audio and subtitle track selection rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackConfig {
    /// Position among audio streams (0-based); wins over `audio_lang`
    pub audio_track: Option<usize>,
    /// Language priority list, e.g. ["fre", "eng"]
    pub audio_lang: Vec<String>,
    /// Position among subtitle streams (0-based)
    pub subtitle_track: Option<usize>,
    pub subtitle_lang: Vec<String>,
    pub prefer_forced_subs: bool,
    pub no_subtitles: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            audio_track: None,
            audio_lang: Vec::new(),
            subtitle_track: None,
            subtitle_lang: Vec::new(),
            prefer_forced_subs: true,
            no_subtitles: false,
        }
    }
}

/// Encoder backend and quality knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncodingConfig {
    pub backend: HwChoice,
    pub vaapi_device: PathBuf,
    pub profile: QualityProfile,
    pub crf: Option<u8>,
    pub preset: Option<String>,
    pub nvenc_cq: Option<u8>,
    pub qsv_quality: Option<u8>,
    pub vaapi_qp: Option<u8>,
    pub amf_qp: Option<u8>,
    pub audio_bitrate: String,
    /// Upper bound for a single capability probe
    pub probe_timeout_secs: u64,
    /// Upper bound for reading one source's stream metadata
    pub ffprobe_timeout_secs: u64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            backend: HwChoice::Auto,
            vaapi_device: PathBuf::from("/dev/dri/renderD128"),
            profile: QualityProfile::Balanced,
            crf: None,
            preset: None,
            nvenc_cq: None,
            qsv_quality: None,
            vaapi_qp: None,
            amf_qp: None,
            audio_bitrate: "192k".to_string(),
            probe_timeout_secs: 6,
            ffprobe_timeout_secs: 60,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

/// Worker pool sizes (0 = auto-derive)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WorkersConfig {
    pub encode: u32,
    pub integrity: u32,
    /// Capacity of the queue between integrity and encode workers (0 = 2x encode workers)
    pub handoff_capacity: u32,
}

/// Source file verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrityConfig {
    pub enabled: bool,
    /// Seconds the file size must stay unchanged
    pub stable_wait_secs: u64,
    /// Number of stability polls before giving up
    pub stable_retries: u32,
    pub min_size_bytes: u64,
    /// Decode the whole video stream before encoding
    pub deep_check: bool,
    pub deep_check_timeout_secs: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stable_wait_secs: 3,
            stable_retries: 3,
            min_size_bytes: 1024 * 1024,
            deep_check: false,
            deep_check_timeout_secs: 3600,
        }
    }
}

/// Encode retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Retry hardware failures (and unavailable backends) on the CPU encoder
    pub cpu_fallback: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_fallback: true,
        }
    }
}

/// Admission control against the destination filesystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiskGuardConfig {
    pub enabled: bool,
    /// Per-output size quota; also passed to the encoder as a hard ceiling
    pub max_output_bytes: Option<u64>,
    /// Free space that must remain after the estimated output is written
    pub reserve_bytes: u64,
    /// Estimated output size as a fraction of the input size
    pub estimate_ratio: f32,
}

impl Default for DiskGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_output_bytes: None,
            reserve_bytes: 256 * 1024 * 1024,
            estimate_ratio: 1.0,
        }
    }
}

/// Conversion history storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub state_dir: Option<PathBuf>,
    pub engine: HistoryEngine,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: None,
            engine: HistoryEngine::Auto,
        }
    }
}

impl HistoryConfig {
    /// Resolve the state directory, following XDG conventions when unset.
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        if let Some(state_home) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(state_home).join("mkv2cast");
        }
        let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_else(env::temp_dir);
        home.join(".local").join("state").join("mkv2cast")
    }
}

/// Log output settings consumed by the binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub tracks: TrackConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub disk_guard: DiskGuardConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MKV2CAST_ENCODE_WORKERS -> workers.encode
    /// - MKV2CAST_INTEGRITY_WORKERS -> workers.integrity
    /// - MKV2CAST_BACKEND -> encoding.backend
    /// - MKV2CAST_CONTAINER -> output.container
    /// - MKV2CAST_PROFILE -> encoding.profile
    /// - MKV2CAST_STATE_DIR -> history.state_dir
    /// - MKV2CAST_DRY_RUN -> output.dry_run
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MKV2CAST_ENCODE_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.encode = workers;
            }
        }

        if let Ok(val) = env::var("MKV2CAST_INTEGRITY_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.integrity = workers;
            }
        }

        if let Ok(val) = env::var("MKV2CAST_BACKEND") {
            if let Some(backend) = HwChoice::parse(&val) {
                self.encoding.backend = backend;
            }
        }

        if let Ok(val) = env::var("MKV2CAST_CONTAINER") {
            if let Some(container) = Container::parse(&val) {
                self.output.container = container;
            }
        }

        if let Ok(val) = env::var("MKV2CAST_PROFILE") {
            if let Some(profile) = QualityProfile::parse(&val) {
                self.encoding.profile = profile;
            }
        }

        if let Ok(val) = env::var("MKV2CAST_STATE_DIR") {
            if !val.is_empty() {
                self.history.state_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("MKV2CAST_DRY_RUN") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.output.dry_run = true,
                "false" | "0" | "no" => self.output.dry_run = false,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject values that would only fail once jobs are running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let suffix = &self.output.suffix;
        if suffix.is_empty() {
            return Err(ConfigError::Invalid("output.suffix must not be empty".into()));
        }
        if suffix.contains('/') || suffix.contains('\\') {
            return Err(ConfigError::Invalid(format!(
                "output.suffix '{}' must not contain a path separator",
                suffix
            )));
        }

        for (name, value) in [
            ("workers.encode", self.workers.encode),
            ("workers.integrity", self.workers.integrity),
        ] {
            if value > MAX_WORKERS {
                return Err(ConfigError::Invalid(format!(
                    "{} = {} exceeds the maximum of {}",
                    name, value, MAX_WORKERS
                )));
            }
        }

        if let Some(crf) = self.encoding.crf {
            if crf > MAX_CRF {
                return Err(ConfigError::Invalid(format!(
                    "encoding.crf = {} exceeds {}",
                    crf, MAX_CRF
                )));
            }
        }

        if self.encoding.ffprobe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "encoding.ffprobe_timeout_secs must be at least 1".into(),
            ));
        }

        if self.encoding.audio_bitrate.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "encoding.audio_bitrate must not be empty".into(),
            ));
        }

        let ratio = self.disk_guard.estimate_ratio;
        if ratio.is_nan() || ratio <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "disk_guard.estimate_ratio = {} must be positive",
                self.disk_guard.estimate_ratio
            )));
        }

        if self.integrity.stable_wait_secs > 0 && self.integrity.stable_retries == 0 {
            return Err(ConfigError::Invalid(
                "integrity.stable_retries must be at least 1 when stable_wait_secs is set".into(),
            ));
        }

        Ok(())
    }
}
