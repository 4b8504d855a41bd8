//! mkv2cast
//!
//! Converts media files into a cast-compatible form (H.264 video, AAC audio,
//! MKV or MP4 container), re-encoding only the streams that need it.

pub mod backend;
pub mod command;
pub mod concurrency;
pub mod decision;
pub mod disk_guard;
pub mod error;
pub mod events;
pub mod history;
pub mod integrity;
pub mod job;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod progress;
pub mod replace;
pub mod stability;
pub mod startup;

pub use mkv2cast_config as config;
pub use mkv2cast_config::Config;

pub use backend::{Backend, BackendError, BackendSelector, CapabilityProbe, FfmpegCapabilityProbe};
pub use command::{build, output_path, temp_path, QualitySettings, TranscodeCommand};
pub use concurrency::{derive_plan, WorkerPlan};
pub use decision::{decide, Decision, DecisionError, TrackSelection};
pub use disk_guard::{check_disk_guard, DiskGuardResult, FreeSpace, SystemFreeSpace};
pub use error::{ErrorKind, JobError, PipelineError};
pub use events::{spawn_callback_adapter, CallbackError, EventCallback, PipelineEvent, EVENT_CHANNEL_CAPACITY};
pub use history::{
    open_store, CloseDetails, HistoryError, HistoryRecord, HistoryStats, HistoryStatus, HistoryStore,
    HistoryTracker,
};
pub use integrity::{FileIntegrityChecker, IntegrityChecker, IntegrityError};
pub use job::{Job, JobResult, JobState};
pub use pipeline::{Pipeline, PipelineBuilder, RunSummary};
pub use probe::{FfprobeProber, ProbeError, Prober, StreamDescriptor, StreamInfo, StreamKind};
pub use process::{EncodeError, EncoderProcess, FfmpegProcess, ProcessExit};
pub use progress::{ProgressParser, ProgressSnapshot, Stage};
pub use startup::{check_requirements, parse_ffmpeg_version, StartupError, ToolVersions};
