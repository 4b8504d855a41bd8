//! Progress parsing for encoder output.
//!
//! Turns ffmpeg stats lines (`frame= fps= size= time= bitrate= speed=`) and
//! `-progress` key/value lines into [`ProgressSnapshot`]s. The parser keeps
//! constant-size state per job.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Phase a job is in, as shown to the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Integrity checks and probing.
    Checking,
    /// Video is re-encoded.
    Transcode,
    /// Only audio is re-encoded.
    Audio,
    /// Streams are copied into a new container.
    Remux,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Checking => "checking",
            Stage::Transcode => "transcode",
            Stage::Audio => "audio",
            Stage::Remux => "remux",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known progress of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    /// 0..=100; `None` when the duration is unknown.
    pub percent: Option<f64>,
    pub fps: Option<f64>,
    pub eta_seconds: Option<u64>,
    /// Encoder-reported bitrate, e.g. "2097.2kbits/s".
    pub bitrate: Option<String>,
    /// Encode speed as a multiple of real time.
    pub speed: Option<f64>,
    pub current_time_ms: u64,
    pub duration_ms: Option<u64>,
    /// Last line reporting an error.
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn new(stage: Stage, duration_ms: Option<u64>) -> Self {
        Self {
            stage,
            percent: None,
            fps: None,
            eta_seconds: None,
            bitrate: None,
            speed: None,
            current_time_ms: 0,
            duration_ms: duration_ms.filter(|d| *d > 0),
            error: None,
        }
    }

    /// False when consumers should show "no ETA".
    pub fn has_eta(&self) -> bool {
        self.duration_ms.is_some() && self.eta_seconds.is_some()
    }
}

struct Patterns {
    clock: Regex,
    micros: Regex,
    fps: Regex,
    bitrate: Regex,
    speed: Regex,
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).unwrap_or_else(|e| panic!("invalid progress pattern {source}: {e}"))
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    clock: pattern(r"time=\s*(-?)(\d+):(\d{1,2}):(\d{1,2})(?:[.,](\d+))?"),
    micros: pattern(r"out_time_(?:us|ms)=\s*(-?\d+)"),
    fps: pattern(r"fps=\s*(\d+(?:\.\d+)?)"),
    bitrate: pattern(r"bitrate=\s*(\d+(?:\.\d+)?\s*[kKmM]?bits/s)"),
    speed: pattern(r"speed=\s*(\d+(?:\.\d+)?)x"),
});

/// Messages ffmpeg prints on failure, matched at the start of the line or
/// after a `[component @ addr] ` prefix.
const ERROR_PREFIXES: &[&str] = &[
    "Error ",
    "Error:",
    "Conversion failed",
    "Invalid data found",
    "Could not ",
    "Unknown encoder",
];

/// True for ffmpeg error reports; metadata and stream dumps never match.
pub fn is_error_line(line: &str) -> bool {
    if line.get(..7).is_some_and(|head| head.eq_ignore_ascii_case("[error]")) {
        return true;
    }
    let message = match line.strip_prefix('[').and_then(|rest| rest.split_once("] ")) {
        Some((_, message)) => message,
        None => line,
    };
    ERROR_PREFIXES.iter().any(|prefix| message.starts_with(prefix)) || message.contains(" error while ")
}

/// Parse `HH:MM:SS[.,]frac` into milliseconds; `None` for negative or malformed times.
///
/// The fractional part is read as a decimal fraction, so `.5`, `.50` and
/// `,500` all mean 500 ms.
pub fn parse_clock_ms(hours: &str, minutes: &str, seconds: &str, fraction: Option<&str>) -> Option<u64> {
    let h: u64 = hours.parse().ok()?;
    let m: u64 = minutes.parse().ok()?;
    let s: u64 = seconds.parse().ok()?;
    let frac_ms = match fraction {
        Some(frac) if !frac.is_empty() => {
            let digits: String = frac.chars().take(3).collect();
            let value: u64 = digits.parse().ok()?;
            value * 10u64.pow(3 - digits.len() as u32)
        }
        _ => 0,
    };
    Some(((h * 60 + m) * 60 + s) * 1000 + frac_ms)
}

/// Incremental parser for one job's encoder output.
pub struct ProgressParser {
    snapshot: ProgressSnapshot,
}

impl ProgressParser {
    /// Create a parser for the given stage and container duration.
    pub fn new(stage: Stage, duration_ms: Option<u64>) -> Self {
        Self {
            snapshot: ProgressSnapshot::new(stage, duration_ms),
        }
    }

    /// Start a new stage; time, rate and ETA fields are reset.
    pub fn begin_stage(&mut self, stage: Stage) {
        self.snapshot = ProgressSnapshot::new(stage, self.snapshot.duration_ms);
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Feed one line of encoder output.
    ///
    /// # Returns
    /// The updated snapshot when the line changed it, `None` otherwise.
    pub fn feed(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let patterns = &*PATTERNS;
        let mut changed = false;

        if let Some(time_ms) = parse_time(patterns, line) {
            self.snapshot.current_time_ms = self.snapshot.current_time_ms.max(time_ms);
            changed = true;
        }

        if let Some(fps) = capture_f64(&patterns.fps, line) {
            self.snapshot.fps = Some(fps);
            changed = true;
        }

        if let Some(caps) = patterns.bitrate.captures(line) {
            if let Some(value) = caps.get(1) {
                self.snapshot.bitrate = Some(value.as_str().replace(' ', ""));
                changed = true;
            }
        }

        if let Some(speed) = capture_f64(&patterns.speed, line) {
            self.snapshot.speed = Some(speed);
            changed = true;
        }

        if is_error_line(line) {
            self.snapshot.error = Some(line.to_string());
            changed = true;
        }

        if !changed {
            return None;
        }
        self.recompute();
        Some(self.snapshot.clone())
    }

    fn recompute(&mut self) {
        let snap = &mut self.snapshot;
        let Some(duration) = snap.duration_ms else {
            snap.percent = None;
            snap.eta_seconds = None;
            return;
        };

        let current = snap.current_time_ms.min(duration);
        snap.percent = Some((current as f64 / duration as f64 * 100.0).clamp(0.0, 100.0));

        snap.eta_seconds = match snap.speed {
            Some(speed) if speed > 0.0 => {
                let remaining_ms = (duration - current) as f64;
                Some((remaining_ms / speed / 1000.0).round() as u64)
            }
            _ => None,
        };
    }
}

fn parse_time(patterns: &Patterns, line: &str) -> Option<u64> {
    if let Some(caps) = patterns.micros.captures(line) {
        let micros: i64 = caps.get(1)?.as_str().parse().ok()?;
        return if micros < 0 {
            None
        } else {
            Some(micros as u64 / 1000)
        };
    }

    let caps = patterns.clock.captures(line)?;
    if !caps.get(1).map(|m| m.as_str()).unwrap_or("").is_empty() {
        return None;
    }
    parse_clock_ms(
        caps.get(2)?.as_str(),
        caps.get(3)?.as_str(),
        caps.get(4)?.as_str(),
        caps.get(5).map(|m| m.as_str()),
    )
}

fn capture_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)?
        .get(1)?
        .as_str()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
