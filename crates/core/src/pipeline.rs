//! Conversion pipeline.
//!
//! Two bounded worker pools connected by a hand-off queue. Integrity workers
//! pull queued jobs in order, verify the source, probe it and make the
//! transcode decision. Encode workers pull checked jobs, pass them through the
//! disk guard, run the encoder and promote the finished output.
//!
//! ```text
//! inputs -> [queue] -> integrity workers -> [hand-off] -> encode workers -> results
//! ```
//!
//! Cancelling the run's token stops admission, kills running encoders and
//! marks every unfinished job `Interrupted`.

use crate::backend::{Backend, BackendError, BackendSelector, CapabilityProbe, FfmpegCapabilityProbe};
use crate::command::{build, output_path, temp_path};
use crate::concurrency::WorkerPlan;
use crate::config::Config;
use crate::decision::decide;
use crate::disk_guard::{check_disk_guard, estimate_output_bytes, FreeSpace, Reservation, Reservations, SystemFreeSpace};
use crate::error::{JobError, PipelineError};
use crate::events::{EventSink, PipelineEvent};
use crate::history::{open_store, CloseDetails, HistoryTracker};
use crate::integrity::{FileIntegrityChecker, IntegrityChecker, IntegrityError};
use crate::job::{Job, JobResult, JobState};
use crate::probe::{FfprobeProber, Prober};
use crate::process::{EncoderProcess, FfmpegProcess, ProcessExit};
use crate::progress::{ProgressParser, ProgressSnapshot};
use crate::replace::{discard_partial, promote_output};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A job together with its position in the input list.
struct Slot {
    index: usize,
    job: Job,
}

/// How a job ended.
enum Outcome {
    Done {
        output: PathBuf,
        output_size: Option<u64>,
        encode_seconds: f64,
    },
    Skipped(String),
    Failed(JobError),
    Interrupted,
}

/// Result of a whole run, one entry per input in input order.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub results: Vec<JobResult>,
    /// Backend resolved at start; `None` when the requested one was unavailable.
    pub backend: Option<Backend>,
    pub plan: WorkerPlan,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: usize,
}

impl RunSummary {
    fn new(results: Vec<JobResult>, backend: Option<Backend>, plan: WorkerPlan) -> Self {
        let count = |state: JobState| results.iter().filter(|r| r.state == state).count();
        let (done, skipped, failed, interrupted) = (
            count(JobState::Done),
            count(JobState::Skipped),
            count(JobState::Failed),
            count(JobState::Interrupted),
        );
        Self {
            done,
            skipped,
            failed,
            interrupted,
            results,
            backend,
            plan,
        }
    }

    /// True when nothing failed and nothing was interrupted.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.interrupted == 0
    }
}

/// Builder for [`Pipeline`]; collaborators default to the real ffmpeg/ffprobe ones.
pub struct PipelineBuilder {
    config: Config,
    plan: Option<WorkerPlan>,
    prober: Option<Arc<dyn Prober>>,
    integrity: Option<Arc<dyn IntegrityChecker>>,
    capabilities: Option<Arc<dyn CapabilityProbe>>,
    encoder: Option<Arc<dyn EncoderProcess>>,
    free_space: Option<Arc<dyn FreeSpace>>,
    history: Option<Arc<HistoryTracker>>,
    events: EventSink,
    output_dir: Option<PathBuf>,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            plan: None,
            prober: None,
            integrity: None,
            capabilities: None,
            encoder: None,
            free_space: None,
            history: None,
            events: EventSink::disabled(),
            output_dir: None,
            cancel: None,
        }
    }

    pub fn worker_plan(mut self, plan: WorkerPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn integrity_checker(mut self, checker: Arc<dyn IntegrityChecker>) -> Self {
        self.integrity = Some(checker);
        self
    }

    pub fn capability_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.capabilities = Some(probe);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn EncoderProcess>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn free_space(mut self, free_space: Arc<dyn FreeSpace>) -> Self {
        self.free_space = Some(free_space);
        self
    }

    /// Use this tracker instead of opening the configured store.
    pub fn history(mut self, tracker: Arc<HistoryTracker>) -> Self {
        self.history = Some(tracker);
        self
    }

    pub fn events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// Write outputs here instead of next to each input.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate the configuration and open history.
    ///
    /// # Errors
    /// * `PipelineError::Config` - the configuration is invalid
    /// * `PipelineError::History` - history is enabled and no engine could be opened
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let history = match self.history {
            Some(tracker) => Some(tracker),
            None if config.history.enabled => {
                let dir = config.history.resolved_state_dir();
                let store = open_store(config.history.engine, &dir)?;
                info!(engine = store.engine(), dir = %dir.display(), "History store opened");
                Some(Arc::new(HistoryTracker::new(store)))
            }
            None => None,
        };

        Ok(Pipeline {
            plan: self.plan.unwrap_or_else(|| WorkerPlan::derive(&config)),
            prober: self
                .prober
                .unwrap_or_else(|| Arc::new(FfprobeProber::from_config(&config))),
            integrity: self
                .integrity
                .unwrap_or_else(|| Arc::new(FileIntegrityChecker::new(&config))),
            capabilities: self
                .capabilities
                .unwrap_or_else(|| Arc::new(FfmpegCapabilityProbe::from_config(&config))),
            encoder: self.encoder.unwrap_or_else(|| Arc::new(FfmpegProcess)),
            free_space: self.free_space.unwrap_or_else(|| Arc::new(SystemFreeSpace)),
            history,
            events: self.events,
            output_dir: self.output_dir,
            cancel: self.cancel.unwrap_or_default(),
            config,
        })
    }
}

/// The conversion pipeline for one configuration.
pub struct Pipeline {
    config: Arc<Config>,
    plan: WorkerPlan,
    prober: Arc<dyn Prober>,
    integrity: Arc<dyn IntegrityChecker>,
    capabilities: Arc<dyn CapabilityProbe>,
    encoder: Arc<dyn EncoderProcess>,
    free_space: Arc<dyn FreeSpace>,
    history: Option<Arc<HistoryTracker>>,
    events: EventSink,
    output_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Token that interrupts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn plan(&self) -> &WorkerPlan {
        &self.plan
    }

    pub fn history(&self) -> Option<&Arc<HistoryTracker>> {
        self.history.as_ref()
    }

    /// Convert `inputs`, returning one result per input in input order.
    pub async fn run(&self, inputs: Vec<PathBuf>) -> Result<RunSummary, PipelineError> {
        if inputs.is_empty() {
            return Ok(RunSummary::new(Vec::new(), None, self.plan.clone()));
        }

        let backend = BackendSelector::new(Arc::clone(&self.capabilities))
            .pick(&self.config)
            .await;
        if let Err(e) = &backend {
            warn!(error = %e, "Requested encoder backend is unavailable");
        }

        info!(
            inputs = inputs.len(),
            encode_workers = self.plan.encode_workers,
            integrity_workers = self.plan.integrity_workers,
            backend = %backend.as_ref().map(|b| b.as_str()).unwrap_or("unavailable"),
            "Starting conversion run"
        );

        let ctx = Arc::new(RunContext {
            config: Arc::clone(&self.config),
            prober: Arc::clone(&self.prober),
            integrity: Arc::clone(&self.integrity),
            encoder: Arc::clone(&self.encoder),
            free_space: Arc::clone(&self.free_space),
            history: self.history.clone(),
            events: self.events.clone(),
            output_dir: self.output_dir.clone(),
            cancel: self.cancel.clone(),
            backend: backend.clone(),
            reservations: Reservations::new(),
            admission: Mutex::new(()),
            results: Mutex::new(vec![None; inputs.len()]),
        });

        let (queue_tx, queue_rx) = mpsc::channel::<Slot>(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let slot = Slot {
                index,
                job: Job::new(input.clone()),
            };
            if queue_tx.send(slot).await.is_err() {
                error!(path = %input.display(), "Job queue closed while filling");
            }
        }
        drop(queue_tx);

        let queue = Arc::new(AsyncMutex::new(queue_rx));
        let (handoff_tx, handoff_rx) = mpsc::channel::<Slot>(self.plan.handoff_capacity.max(1));
        let handoff = Arc::new(AsyncMutex::new(handoff_rx));

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for _ in 0..self.plan.integrity_workers.max(1) {
            workers.push(tokio::spawn(check_worker(
                Arc::clone(&ctx),
                Arc::clone(&queue),
                handoff_tx.clone(),
            )));
        }
        drop(handoff_tx);
        for _ in 0..self.plan.encode_workers.max(1) {
            workers.push(tokio::spawn(encode_worker(Arc::clone(&ctx), Arc::clone(&handoff))));
        }

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Pipeline worker task failed");
            }
        }

        // Jobs still waiting in either queue never started or never encoded.
        let mut leftovers = drain(&queue).await;
        leftovers.extend(drain(&handoff).await);
        for slot in leftovers {
            let outcome = ctx.unfinished_outcome();
            ctx.finish(slot, outcome).await;
        }

        let missing: Vec<usize> = {
            let results = ctx.lock_results();
            results
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_none())
                .map(|(i, _)| i)
                .collect()
        };
        for index in missing {
            let job = Job::new(inputs[index].clone());
            let outcome = ctx.unfinished_outcome();
            ctx.finish(Slot { index, job }, outcome).await;
        }

        let results: Vec<JobResult> = ctx.lock_results().drain(..).flatten().collect();
        let summary = RunSummary::new(results, backend.ok(), self.plan.clone());
        info!(
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "Conversion run finished"
        );
        Ok(summary)
    }
}

async fn drain(rx: &AsyncMutex<mpsc::Receiver<Slot>>) -> Vec<Slot> {
    let mut rx = rx.lock().await;
    let mut slots = Vec::new();
    while let Ok(slot) = rx.try_recv() {
        slots.push(slot);
    }
    slots
}

/// Next slot from a shared queue, or `None` when closed or cancelled.
async fn next_slot(rx: &AsyncMutex<mpsc::Receiver<Slot>>, cancel: &CancellationToken) -> Option<Slot> {
    let mut rx = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        guard = rx.lock() => guard,
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        slot = rx.recv() => slot,
    }
}

async fn check_worker(
    ctx: Arc<RunContext>,
    queue: Arc<AsyncMutex<mpsc::Receiver<Slot>>>,
    handoff: mpsc::Sender<Slot>,
) {
    while let Some(mut slot) = next_slot(&queue, &ctx.cancel).await {
        if let Some(outcome) = ctx.check(&mut slot.job).await {
            ctx.finish(slot, outcome).await;
            continue;
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                ctx.finish(slot, Outcome::Interrupted).await;
            }
            permit = handoff.reserve() => match permit {
                Ok(permit) => permit.send(slot),
                Err(_) => ctx.finish(slot, Outcome::Interrupted).await,
            },
        }
    }
}

async fn encode_worker(ctx: Arc<RunContext>, handoff: Arc<AsyncMutex<mpsc::Receiver<Slot>>>) {
    while let Some(mut slot) = next_slot(&handoff, &ctx.cancel).await {
        let outcome = ctx.encode(&mut slot.job).await;
        ctx.finish(slot, outcome).await;
    }
}

/// State shared by the workers of one run.
struct RunContext {
    config: Arc<Config>,
    prober: Arc<dyn Prober>,
    integrity: Arc<dyn IntegrityChecker>,
    encoder: Arc<dyn EncoderProcess>,
    free_space: Arc<dyn FreeSpace>,
    history: Option<Arc<HistoryTracker>>,
    events: EventSink,
    output_dir: Option<PathBuf>,
    cancel: CancellationToken,
    backend: Result<Backend, BackendError>,
    reservations: Reservations,
    /// Serializes disk guard check-and-reserve.
    admission: Mutex<()>,
    results: Mutex<Vec<Option<JobResult>>>,
}

impl RunContext {
    fn lock_results(&self) -> std::sync::MutexGuard<'_, Vec<Option<JobResult>>> {
        self.results.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unfinished_outcome(&self) -> Outcome {
        if self.cancel.is_cancelled() {
            Outcome::Interrupted
        } else {
            Outcome::Failed(JobError::EncodeProcessFailed(
                "pipeline worker stopped before the job finished".to_string(),
            ))
        }
    }

    async fn state_changed(&self, job: &Job) {
        self.events
            .send(PipelineEvent::StateChanged {
                job_id: job.id,
                path: job.input.clone(),
                state: job.state,
            })
            .await;
    }

    /// Integrity stage. `None` means the job is ready to encode.
    async fn check(&self, job: &mut Job) -> Option<Outcome> {
        job.state = JobState::Checking;
        job.started_at = Some(Utc::now());
        job.input_size = tokio::fs::metadata(&job.input).await.ok().map(|m| m.len());
        self.state_changed(job).await;

        if let Some(history) = &self.history {
            if let Err(e) = history.open(job) {
                warn!(job_id = %job.id, error = %e, "Failed to record job start");
            }
        }

        match self.integrity.verify(&job.input, &self.cancel).await {
            Ok(()) => {}
            Err(IntegrityError::Cancelled) => return Some(Outcome::Interrupted),
            Err(e) => return Some(Outcome::Failed(e.into())),
        }

        let info = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Some(Outcome::Interrupted),
            probed = self.prober.probe(&job.input) => match probed {
                Ok(info) => info,
                Err(e) => return Some(Outcome::Failed(JobError::ProbeFailed(e.to_string()))),
            },
        };
        job.duration_ms = info.duration_ms;

        let decision = match decide(&info, &self.config) {
            Ok(decision) => decision,
            Err(e) => return Some(Outcome::Failed(JobError::ProbeFailed(e.to_string()))),
        };
        debug!(
            job_id = %job.id,
            video = %decision.video_reason,
            audio = %decision.audio_reason,
            subtitle = %decision.subtitle_reason,
            "Decision made"
        );

        let compatible = decision.is_compatible();
        let output = output_path(&job.input, &decision, &self.config, self.output_dir.as_deref());
        let temp = temp_path(&output, job.id);
        job.output = Some(output.clone());
        job.temp = Some(temp.clone());
        job.decision = Some(decision);

        if compatible && self.config.output.skip_when_ok {
            return Some(Outcome::Skipped("already compatible".to_string()));
        }
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Some(Outcome::Skipped(format!("output already exists: {}", output.display())));
        }

        if self.config.output.dry_run {
            let backend = self.backend.as_ref().copied().unwrap_or(Backend::Cpu);
            if let Some(decision) = &job.decision {
                let command = build(&job.input, decision, backend, &temp, &self.config);
                info!(job_id = %job.id, command = %command.display(), "Dry run");
            }
            return Some(Outcome::Skipped("dry run".to_string()));
        }

        None
    }

    /// Disk guard admission; the reservation is held until the encode ends.
    fn admit(&self, job: &Job, output: &Path) -> Result<Option<Reservation>, String> {
        let guard = &self.config.disk_guard;
        if !guard.enabled {
            return Ok(None);
        }

        let estimate = estimate_output_bytes(job.input_size.unwrap_or(0), guard.estimate_ratio);
        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let _admission = self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = check_disk_guard(
            estimate,
            guard.max_output_bytes,
            self.free_space.free_bytes(dir),
            guard.reserve_bytes,
            self.reservations.in_flight(),
        );
        match result.reason() {
            None => Ok(Some(self.reservations.reserve(estimate))),
            Some(reason) => Err(reason),
        }
    }

    fn discard(&self, temp: &Path) {
        match discard_partial(temp, self.config.output.discard_dir.as_deref()) {
            Ok(Some(moved)) => info!(path = %moved.display(), "Moved partial output"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to clean up partial output"),
        }
    }

    /// Encode stage with retry and CPU fallback.
    async fn encode(&self, job: &mut Job) -> Outcome {
        let (Some(decision), Some(output), Some(temp)) = (job.decision.clone(), job.output.clone(), job.temp.clone())
        else {
            return Outcome::Failed(JobError::EncodeProcessFailed(
                "job reached encoding without a decision".to_string(),
            ));
        };

        let cfg = &self.config;
        let mut backend = match &self.backend {
            Ok(backend) => *backend,
            Err(e) if cfg.retry.cpu_fallback => {
                warn!(job_id = %job.id, error = %e, backend = %Backend::Cpu, "Falling back to CPU encoder");
                Backend::Cpu
            }
            Err(e) => return Outcome::Failed(e.clone().into()),
        };

        let _reservation = match self.admit(job, &output) {
            Ok(reservation) => reservation,
            Err(reason) => return Outcome::Failed(JobError::DiskQuotaExceeded(reason)),
        };

        if let Some(parent) = output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Outcome::Failed(JobError::EncodeProcessFailed(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                )));
            }
        }

        job.state = JobState::Encoding;
        self.state_changed(job).await;

        let max_attempts: u32 = if cfg.retry.enabled { 2 } else { 1 };
        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            job.attempts = attempt;
            job.backend = Some(backend);

            let command = build(&job.input, &decision, backend, &temp, cfg);
            info!(
                job_id = %job.id,
                path = %job.input.display(),
                backend = %backend,
                stage = %command.stage,
                attempt,
                "Starting encode"
            );
            debug!(job_id = %job.id, command = %command.display(), "Encoder command");

            let mut parser = ProgressParser::new(command.stage, job.duration_ms);
            let mut latest: Option<ProgressSnapshot> = None;
            let exit = {
                let job_ref: &Job = job;
                let mut on_line = |line: &str| {
                    if let Some(snapshot) = parser.feed(line) {
                        self.events.offer(PipelineEvent::Progress {
                            job_id: job_ref.id,
                            path: job_ref.input.clone(),
                            snapshot: snapshot.clone(),
                        });
                        if let Some(history) = &self.history {
                            if let Err(e) = history.update(job_ref, &snapshot) {
                                debug!(job_id = %job_ref.id, error = %e, "Failed to record progress");
                            }
                        }
                        latest = Some(snapshot);
                    }
                };
                self.encoder.run(&command.argv, &mut on_line, &self.cancel).await
            };
            if latest.is_some() {
                job.progress = latest;
            }

            match exit {
                Ok(ProcessExit::Cancelled) => {
                    self.discard(&temp);
                    return Outcome::Interrupted;
                }
                Ok(exit) if exit.success() => {
                    return match promote_output(&temp, &output) {
                        Ok(()) => Outcome::Done {
                            output_size: tokio::fs::metadata(&output).await.ok().map(|m| m.len()),
                            output,
                            encode_seconds: started.elapsed().as_secs_f64(),
                        },
                        Err(e) => {
                            self.discard(&temp);
                            Outcome::Failed(JobError::EncodeProcessFailed(e.to_string()))
                        }
                    };
                }
                Ok(exit) => {
                    if let Err(e) = exit.into_result(parser.snapshot().error.clone()) {
                        last_error = e.to_string();
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            self.discard(&temp);
            if self.cancel.is_cancelled() {
                return Outcome::Interrupted;
            }
            if attempt < max_attempts {
                let next = if backend != Backend::Cpu && cfg.retry.cpu_fallback {
                    Backend::Cpu
                } else {
                    backend
                };
                warn!(
                    job_id = %job.id,
                    backend = %backend,
                    next = %next,
                    attempt,
                    error = %last_error,
                    "Encode failed, retrying"
                );
                backend = next;
            }
        }

        Outcome::Failed(JobError::EncodeProcessFailed(last_error))
    }

    /// Record the terminal state of a job: history, events and result slot.
    async fn finish(&self, slot: Slot, outcome: Outcome) {
        let Slot { index, mut job } = slot;
        job.finished_at = Some(Utc::now());
        let backend_name = job.backend.map(|b| b.to_string());

        let (state, error, reason, written, details) = match outcome {
            Outcome::Done {
                output,
                output_size,
                encode_seconds,
            } => (
                JobState::Done,
                None,
                format!("converted with {}", backend_name.as_deref().unwrap_or("unknown backend")),
                Some(output.clone()),
                CloseDetails {
                    output_path: Some(output),
                    encode_seconds: Some(encode_seconds),
                    error: None,
                    output_size,
                    backend: backend_name,
                },
            ),
            Outcome::Skipped(reason) => (
                JobState::Skipped,
                None,
                reason.clone(),
                None,
                CloseDetails {
                    error: Some(reason),
                    ..CloseDetails::default()
                },
            ),
            Outcome::Failed(err) => (
                JobState::Failed,
                Some(err.kind()),
                err.to_string(),
                None,
                CloseDetails {
                    error: Some(err.to_string()),
                    backend: backend_name,
                    ..CloseDetails::default()
                },
            ),
            Outcome::Interrupted => (
                JobState::Interrupted,
                Some(JobError::Interrupted.kind()),
                JobError::Interrupted.to_string(),
                None,
                CloseDetails {
                    error: Some(JobError::Interrupted.to_string()),
                    backend: backend_name,
                    ..CloseDetails::default()
                },
            ),
        };
        job.state = state;

        if let (Some(history), Some(status)) = (&self.history, state.history_status()) {
            if let Err(e) = history.close(&job, status, details) {
                warn!(job_id = %job.id, error = %e, "Failed to record job result");
            }
        }

        match state {
            JobState::Failed => warn!(job_id = %job.id, path = %job.input.display(), reason = %reason, "Job failed"),
            _ => info!(job_id = %job.id, path = %job.input.display(), state = %state, reason = %reason, "Job finished"),
        }

        let result = JobResult {
            job_id: job.id,
            input: job.input.clone(),
            output: written,
            state,
            backend: job.backend,
            error,
            reason,
            attempts: job.attempts,
        };

        self.state_changed(&job).await;
        self.events.send(PipelineEvent::Finished(result.clone())).await;

        if let Some(entry) = self.lock_results().get_mut(index) {
            *entry = Some(result);
        }
    }
}
