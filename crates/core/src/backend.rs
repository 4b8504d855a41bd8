//! Encoder backend selection.
//!
//! Picks a hardware or software H.264 encoder for the run. In `auto` mode
//! hardware backends are probed in priority order (NVENC, AMF, QSV, VAAPI)
//! and the first that passes wins, with the CPU encoder as the floor. An
//! explicitly requested backend is validated on its own and never replaced.

use crate::config::{Config, HwChoice};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Hardware probe order used in `auto` mode.
pub const AUTO_PRIORITY: [Backend; 4] = [Backend::Nvenc, Backend::Amf, Backend::Qsv, Backend::Vaapi];

/// An H.264 encoder family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Nvenc,
    Amf,
    Qsv,
    Vaapi,
    Cpu,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Nvenc => "nvenc",
            Backend::Amf => "amf",
            Backend::Qsv => "qsv",
            Backend::Vaapi => "vaapi",
            Backend::Cpu => "cpu",
        }
    }

    /// ffmpeg encoder name for this backend.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            Backend::Nvenc => "h264_nvenc",
            Backend::Amf => "h264_amf",
            Backend::Qsv => "h264_qsv",
            Backend::Vaapi => "h264_vaapi",
            Backend::Cpu => "libx264",
        }
    }

    /// Whether the backend needs a DRM render node.
    pub fn needs_device(&self) -> bool {
        matches!(self, Backend::Qsv | Backend::Vaapi)
    }

    /// Map an explicit configuration choice; `None` for `auto`.
    pub fn from_choice(choice: HwChoice) -> Option<Self> {
        match choice {
            HwChoice::Auto => None,
            HwChoice::Nvenc => Some(Backend::Nvenc),
            HwChoice::Amf => Some(Backend::Amf),
            HwChoice::Qsv => Some(Backend::Qsv),
            HwChoice::Vaapi => Some(Backend::Vaapi),
            HwChoice::Cpu => Some(Backend::Cpu),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for backend selection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend cannot encode on this machine.
    #[error("backend {backend} unavailable: {reason}")]
    Unavailable { backend: Backend, reason: String },
}

impl BackendError {
    pub fn unavailable(backend: Backend, reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            backend,
            reason: reason.into(),
        }
    }
}

/// Checks whether a backend can actually encode.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn check(&self, backend: Backend) -> Result<(), BackendError>;
}

#[async_trait]
impl<T: CapabilityProbe + ?Sized> CapabilityProbe for Arc<T> {
    async fn check(&self, backend: Backend) -> Result<(), BackendError> {
        (**self).check(backend).await
    }
}

/// [`CapabilityProbe`] that asks the local ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegCapabilityProbe {
    ffmpeg: PathBuf,
    device: PathBuf,
    timeout: Duration,
}

impl FfmpegCapabilityProbe {
    pub fn new(ffmpeg: impl Into<PathBuf>, device: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            device: device.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.encoding.ffmpeg_path.clone(),
            cfg.encoding.vaapi_device.clone(),
            Duration::from_secs(cfg.encoding.probe_timeout_secs),
        )
    }

    /// Arguments for a 0.2 s synthetic encode with the given backend.
    pub fn test_encode_args(&self, backend: Backend) -> Vec<String> {
        let device = self.device.display().to_string();
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        match backend {
            Backend::Qsv => args.extend([
                "-init_hw_device".to_string(),
                format!("qsv=hw:{}", device),
                "-filter_hw_device".to_string(),
                "hw".to_string(),
            ]),
            Backend::Vaapi => args.extend(["-vaapi_device".to_string(), device]),
            _ => {}
        }

        args.extend(
            ["-f", "lavfi", "-i", "testsrc2=size=128x128:rate=30", "-t", "0.2"]
                .iter()
                .map(|s| s.to_string()),
        );

        let codec: &[&str] = match backend {
            Backend::Nvenc => &["-c:v", "h264_nvenc", "-preset", "p4", "-cq", "23"],
            Backend::Amf => &["-c:v", "h264_amf", "-rc", "cqp", "-qp_i", "23", "-qp_p", "23"],
            Backend::Qsv => &["-vf", "format=nv12", "-c:v", "h264_qsv", "-global_quality", "35"],
            Backend::Vaapi => &["-vf", "format=nv12,hwupload", "-c:v", "h264_vaapi", "-qp", "35"],
            Backend::Cpu => &["-c:v", "libx264", "-preset", "ultrafast"],
        };
        args.extend(codec.iter().map(|s| s.to_string()));
        args.extend(["-an", "-f", "null", "-"].iter().map(|s| s.to_string()));
        args
    }

    /// Run ffmpeg with a timeout, killing it when the timeout elapses.
    async fn run(&self, args: &[String]) -> Result<std::process::Output, String> {
        let child = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to run {}: {}", self.ffmpeg.display(), e))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {:?}", self.timeout)),
        }
    }

    async fn has_encoder(&self, name: &str) -> Result<bool, String> {
        let output = self
            .run(&["-hide_banner".to_string(), "-encoders".to_string()])
            .await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(encoder_listed(&listing, name))
    }
}

/// Returns true when `ffmpeg -encoders` output lists `name`.
pub fn encoder_listed(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(name))
}

#[async_trait]
impl CapabilityProbe for FfmpegCapabilityProbe {
    async fn check(&self, backend: Backend) -> Result<(), BackendError> {
        if backend.needs_device() && !tokio::fs::try_exists(&self.device).await.unwrap_or(false) {
            return Err(BackendError::unavailable(
                backend,
                format!("device {} not found", self.device.display()),
            ));
        }

        let listed = self
            .has_encoder(backend.encoder_name())
            .await
            .map_err(|reason| BackendError::unavailable(backend, reason))?;
        if !listed {
            return Err(BackendError::unavailable(
                backend,
                format!("encoder {} not built into ffmpeg", backend.encoder_name()),
            ));
        }

        let output = self
            .run(&self.test_encode_args(backend))
            .await
            .map_err(|reason| BackendError::unavailable(backend, reason))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(BackendError::unavailable(
                backend,
                format!("test encode failed: {}", stderr.trim()),
            ))
        }
    }
}

/// Resolves the backend for a run.
pub struct BackendSelector<P> {
    probe: P,
}

impl<P: CapabilityProbe> BackendSelector<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// Pick the backend for the configured choice.
    ///
    /// # Returns
    /// * `Ok(Backend)` - the first working hardware backend in `auto` mode
    ///   (CPU when none work), or the requested backend when it works
    /// * `Err(BackendError::Unavailable)` - an explicitly requested backend failed its probe
    pub async fn pick(&self, cfg: &Config) -> Result<Backend, BackendError> {
        if let Some(explicit) = Backend::from_choice(cfg.encoding.backend) {
            if explicit == Backend::Cpu {
                return Ok(Backend::Cpu);
            }
            self.probe.check(explicit).await?;
            info!(backend = %explicit, "Using requested encoder backend");
            return Ok(explicit);
        }

        for candidate in AUTO_PRIORITY {
            match self.probe.check(candidate).await {
                Ok(()) => {
                    info!(backend = %candidate, "Selected hardware encoder backend");
                    return Ok(candidate);
                }
                Err(e) => debug!(backend = %candidate, error = %e, "Backend probe failed"),
            }
        }

        info!(backend = %Backend::Cpu, "No hardware encoder available, using CPU");
        Ok(Backend::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Probe that succeeds only for the listed backends and records every call.
    struct FakeProbe {
        working: HashSet<Backend>,
        calls: Mutex<Vec<Backend>>,
    }

    impl FakeProbe {
        fn new(working: &[Backend]) -> Self {
            Self {
                working: working.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CapabilityProbe for FakeProbe {
        async fn check(&self, backend: Backend) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(backend);
            if self.working.contains(&backend) {
                Ok(())
            } else {
                Err(BackendError::unavailable(backend, "not present"))
            }
        }
    }

    fn config_with(choice: HwChoice) -> Config {
        let mut cfg = Config::default();
        cfg.encoding.backend = choice;
        cfg
    }

    #[tokio::test]
    async fn test_auto_follows_priority() {
        let selector = BackendSelector::new(FakeProbe::new(&[Backend::Qsv, Backend::Vaapi]));
        let picked = selector.pick(&config_with(HwChoice::Auto)).await.unwrap();

        assert_eq!(picked, Backend::Qsv);
        assert_eq!(
            *selector.probe.calls.lock().unwrap(),
            vec![Backend::Nvenc, Backend::Amf, Backend::Qsv]
        );
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_cpu() {
        let selector = BackendSelector::new(FakeProbe::new(&[]));
        let picked = selector.pick(&config_with(HwChoice::Auto)).await.unwrap();
        assert_eq!(picked, Backend::Cpu);
    }

    #[tokio::test]
    async fn test_explicit_backend_only_probes_itself() {
        let selector = BackendSelector::new(FakeProbe::new(&[Backend::Nvenc, Backend::Vaapi]));
        let picked = selector.pick(&config_with(HwChoice::Vaapi)).await.unwrap();

        assert_eq!(picked, Backend::Vaapi);
        assert_eq!(*selector.probe.calls.lock().unwrap(), vec![Backend::Vaapi]);
    }

    #[tokio::test]
    async fn test_explicit_backend_unavailable_is_error() {
        let selector = BackendSelector::new(FakeProbe::new(&[Backend::Nvenc]));
        let result = selector.pick(&config_with(HwChoice::Vaapi)).await;

        assert!(matches!(
            result,
            Err(BackendError::Unavailable { backend: Backend::Vaapi, .. })
        ));
    }

    #[tokio::test]
    async fn test_explicit_cpu_needs_no_probe() {
        let selector = BackendSelector::new(FakeProbe::new(&[]));
        let picked = selector.pick(&config_with(HwChoice::Cpu)).await.unwrap();
        assert_eq!(picked, Backend::Cpu);
        assert!(selector.probe.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_device_is_unavailable() {
        let probe = FfmpegCapabilityProbe::new(
            "/nonexistent/ffmpeg",
            "/nonexistent/renderD128",
            Duration::from_secs(1),
        );
        let result = probe.check(Backend::Vaapi).await;
        match result {
            Err(BackendError::Unavailable { backend, reason }) => {
                assert_eq!(backend, Backend::Vaapi);
                assert!(reason.contains("device"));
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_encoder_listed() {
        let listing = " V....D libx264              libx264 H.264 / AVC\n V....D h264_vaapi           H.264/AVC (VAAPI)\n";
        assert!(encoder_listed(listing, "libx264"));
        assert!(encoder_listed(listing, "h264_vaapi"));
        assert!(!encoder_listed(listing, "h264_nvenc"));
    }

    #[test]
    fn test_vaapi_test_encode_uses_device() {
        let probe = FfmpegCapabilityProbe::new("ffmpeg", "/dev/dri/renderD129", Duration::from_secs(6));
        let args = probe.test_encode_args(Backend::Vaapi);
        let pos = args.iter().position(|a| a == "-vaapi_device").unwrap();
        assert_eq!(args[pos + 1], "/dev/dri/renderD129");
        assert!(args.contains(&"h264_vaapi".to_string()));
        assert!(args.contains(&"testsrc2=size=128x128:rate=30".to_string()));
    }
}
