//! CLI entry point for mkv2cast
//!
//! Parses command line arguments, wires Ctrl-C to the pipeline's
//! cancellation token and prints per-file results.

use clap::Parser;
use mkv2cast::config::{Container, HwChoice, QualityProfile};
use mkv2cast::{
    check_requirements, open_store, spawn_callback_adapter, CallbackError, Config, EventCallback,
    HistoryStatus, HistoryTracker, JobState, Pipeline, PipelineEvent, RunSummary, EVENT_CHANNEL_CAPACITY,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code used when the run was interrupted.
const EXIT_INTERRUPTED: u8 = 130;

/// mkv2cast - convert videos for Chromecast and smart TVs
#[derive(Parser, Debug)]
#[command(name = "mkv2cast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to convert
    inputs: Vec<PathBuf>,

    /// Path to a configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write outputs to this directory instead of next to the inputs
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Encoder backend: auto, nvenc, amf, qsv, vaapi or cpu
    #[arg(long, value_parser = parse_backend)]
    backend: Option<HwChoice>,

    /// Output container: mkv or mp4
    #[arg(long, value_parser = parse_container)]
    container: Option<Container>,

    /// Quality profile: fast, balanced or quality
    #[arg(long, value_parser = parse_profile)]
    profile: Option<QualityProfile>,

    /// Number of concurrent encodes (0 = auto)
    #[arg(long)]
    encode_workers: Option<u32>,

    /// Number of concurrent integrity checks (0 = auto)
    #[arg(long)]
    integrity_workers: Option<u32>,

    /// Decide and print commands without encoding
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Skip the ffmpeg/ffprobe availability check
    #[arg(long)]
    skip_checks: bool,

    /// Show the N most recent history records and exit
    #[arg(long, value_name = "N")]
    history: Option<usize>,

    /// Show history statistics and exit
    #[arg(long)]
    history_stats: bool,

    /// Delete history records older than DAYS and exit
    #[arg(long, value_name = "DAYS")]
    prune_history: Option<u32>,
}

fn parse_backend(value: &str) -> Result<HwChoice, String> {
    HwChoice::parse(value).ok_or_else(|| format!("unknown backend '{}'", value))
}

fn parse_container(value: &str) -> Result<Container, String> {
    Container::parse(value).ok_or_else(|| format!("unknown container '{}'", value))
}

fn parse_profile(value: &str) -> Result<QualityProfile, String> {
    QualityProfile::parse(value).ok_or_else(|| format!("unknown profile '{}'", value))
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Some(backend) = args.backend {
        config.encoding.backend = backend;
    }
    if let Some(container) = args.container {
        config.output.container = container;
    }
    if let Some(profile) = args.profile {
        config.encoding.profile = profile;
    }
    if let Some(workers) = args.encode_workers {
        config.workers.encode = workers;
    }
    if let Some(workers) = args.integrity_workers {
        config.workers.integrity = workers;
    }
    if args.dry_run {
        config.output.dry_run = true;
    }
    if args.json_logs {
        config.logging.json = true;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn history_queries(args: &Args, config: &Config) -> Result<(), String> {
    let store = open_store(config.history.engine, &config.history.resolved_state_dir()).map_err(|e| e.to_string())?;
    let tracker = HistoryTracker::new(store);

    if let Some(days) = args.prune_history {
        let removed = tracker.prune_older_than(days).map_err(|e| e.to_string())?;
        println!("Removed {} history records older than {} days", removed, days);
    }

    if let Some(limit) = args.history {
        for record in tracker.recent(limit).map_err(|e| e.to_string())? {
            println!(
                "{}  {:<11}  {}{}",
                record.started_at.format("%Y-%m-%d %H:%M:%S"),
                record.status.as_str(),
                record.input_path.display(),
                record
                    .error
                    .as_deref()
                    .map(|e| format!("  ({})", e))
                    .unwrap_or_default()
            );
        }
    }

    if args.history_stats {
        let stats = tracker.stats().map_err(|e| e.to_string())?;
        for status in [
            HistoryStatus::Done,
            HistoryStatus::Skipped,
            HistoryStatus::Failed,
            HistoryStatus::Interrupted,
            HistoryStatus::Running,
        ] {
            println!("{:<12} {}", status.as_str(), stats.count(status));
        }
        if let Some(avg) = stats.avg_encode_seconds {
            println!("avg encode   {:.1}s", avg);
        }
        println!("total encode {:.1}s", stats.total_encode_seconds);
        println!(
            "bytes        {} -> {}",
            stats.total_input_bytes, stats.total_output_bytes
        );
    }
    Ok(())
}

/// Prints one line per finished file.
fn result_printer() -> EventCallback {
    Box::new(|event: &PipelineEvent| -> Result<(), CallbackError> {
        if let PipelineEvent::Finished(result) = event {
            let label = match result.state {
                JobState::Done => "DONE",
                JobState::Skipped => "SKIP",
                JobState::Failed => "FAIL",
                JobState::Interrupted => "STOP",
                _ => return Ok(()),
            };
            match &result.output {
                Some(output) => println!("{}  {} -> {}", label, result.input.display(), output.display()),
                None => println!("{}  {} ({})", label, result.input.display(), result.reason),
            }
        }
        Ok(())
    })
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} converted, {} skipped, {} failed, {} interrupted",
        summary.done, summary.skipped, summary.failed, summary.interrupted
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    if args.history.is_some() || args.history_stats || args.prune_history.is_some() {
        return match history_queries(&args, &config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "History query failed");
                ExitCode::FAILURE
            }
        };
    }

    if args.inputs.is_empty() {
        eprintln!("No input files given");
        return ExitCode::FAILURE;
    }

    if !args.skip_checks {
        if let Err(e) = check_requirements(&config).await {
            error!(error = %e, "Startup check failed");
            return ExitCode::FAILURE;
        }
    }

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut builder = Pipeline::builder(config).events(tx);
    if let Some(dir) = &args.output_dir {
        builder = builder.output_dir(dir.clone());
    }
    let pipeline = match builder.build() {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Failed to start pipeline");
            return ExitCode::FAILURE;
        }
    };
    let printer = spawn_callback_adapter(rx, vec![result_printer()]);

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            cancel.cancel();
        }
    });

    let outcome = pipeline.run(args.inputs.clone()).await;
    drop(pipeline);
    if let Err(e) = printer.await {
        warn!(error = %e, "Result printer stopped");
    }

    match outcome {
        Ok(summary) => {
            print_summary(&summary);
            info!(done = summary.done, failed = summary.failed, "Run complete");
            if summary.interrupted > 0 {
                ExitCode::from(EXIT_INTERRUPTED)
            } else if summary.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::FAILURE
        }
    }
}
