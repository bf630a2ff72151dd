//! clipline CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use clipline::adapters::{
    BuiltinSubtitleWriter, Collaborators, CommandTranscriber, FfmpegAudioExtractor,
    FfmpegVideoEditor, YtDlpFetcher,
};
use clipline::checkpoint::CheckpointStore;
use clipline::config::AppConfig;
use clipline::export::{BatchExporter, ExportRequest, PipelineExportExecutor};
use clipline::llm::LlmRouter;
use clipline::monitor::{ResourceGate, ResourceMonitor};
use clipline::pipeline::{AutoSelection, PipelineCoordinator, ProgressSink, RunOutcome};
use clipline::{PipelineError, Result};

#[derive(Parser, Debug)]
#[command(author, version, about = "Trimmed, subtitled video artifacts from a URL")]
struct Args {
    /// Path to a JSON config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process one video end-to-end.
    Run {
        /// Video URL.
        url: String,
        /// Target translation language.
        #[arg(short = 'l', long)]
        language: Option<String>,
        /// Output directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Resume an interrupted run from its checkpoint.
    Resume {
        /// Run identifier printed when the run started.
        run_id: String,
    },
    /// List incomplete runs that can be resumed.
    List,
    /// Process several URLs (one per line in FILE) as a batch.
    Batch {
        /// File with one video URL per line.
        file: PathBuf,
    },
}

/// Console progress: single-line carriage-return bar.
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, overall: f64, stage: &str, detail: &str) {
        let percent = overall * 100.0;
        let filled = ((overall * 30.0) as usize).min(30);
        let bar: String = "=".repeat(filled) + &"-".repeat(30 - filled);
        eprint!("\r[{bar}] {percent:5.1}% {stage}: {detail}          ");
        if overall >= 1.0 {
            eprintln!();
        }
    }
}

fn build_coordinator(config: AppConfig) -> PipelineCoordinator {
    let router = Arc::new(LlmRouter::new(config.llm.clone()));
    let collaborators = Collaborators {
        fetcher: Arc::new(YtDlpFetcher::new()),
        audio: Arc::new(FfmpegAudioExtractor::new()),
        transcriber: Arc::new(CommandTranscriber::new("large-v3")),
        subtitles: Arc::new(BuiltinSubtitleWriter),
        editor: Arc::new(FfmpegVideoEditor::new()),
    };
    PipelineCoordinator::new(config, collaborators, router, Arc::new(ConsoleProgress))
        .with_selection_handler(Arc::new(AutoSelection))
}

async fn run(args: Args) -> Result<()> {
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;

    match args.command {
        Commands::Run {
            url,
            language,
            output,
        } => {
            if let Some(language) = language {
                config.target_language = language;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }

            let coordinator = Arc::new(build_coordinator(config));
            spawn_ctrl_c_handler(&coordinator);

            match coordinator.run(&url).await? {
                RunOutcome::Completed(project) => {
                    info!(run_id = %project.run_id, "run complete");
                    println!("videos:");
                    for video in &project.exports.videos {
                        println!("  {}", video.path.display());
                    }
                    println!("subtitles:");
                    for subtitle in &project.subtitles {
                        println!("  {}", subtitle.path.display());
                    }
                }
                RunOutcome::AwaitingSelection { run_id } => {
                    println!("run {run_id} is waiting for a selection; resume with `clipline resume {run_id}`");
                }
            }
        }
        Commands::Resume { run_id } => {
            let coordinator = Arc::new(build_coordinator(config));
            spawn_ctrl_c_handler(&coordinator);

            match coordinator.run_from_checkpoint(&run_id).await? {
                RunOutcome::Completed(project) => {
                    info!(run_id = %project.run_id, "resume complete");
                    println!("run {} completed", project.run_id);
                }
                RunOutcome::AwaitingSelection { run_id } => {
                    println!("run {run_id} is still waiting for a selection");
                }
            }
        }
        Commands::List => {
            let store = CheckpointStore::new(&config.state_root)
                .with_expiration_hours(config.checkpoint.expire_after_hours);
            let incomplete = store.list_incomplete().await?;
            if incomplete.is_empty() {
                println!("no incomplete runs");
            }
            for checkpoint in incomplete {
                println!(
                    "{}  {}  {:.0}%  {}",
                    checkpoint.run_id,
                    checkpoint.stage,
                    checkpoint.stage_progress * 100.0,
                    checkpoint.source_url
                );
            }
        }
        Commands::Batch { file } => {
            let raw = tokio::fs::read_to_string(&file).await.map_err(|e| {
                PipelineError::invalid_input(format!("cannot read {}: {e}", file.display()))
            })?;
            let requests: Vec<ExportRequest> = raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .enumerate()
                .map(|(i, url)| ExportRequest {
                    id: format!("batch-{}", i + 1),
                    url: url.to_string(),
                })
                .collect();

            let parallel = config.resource.max_parallel_exports;
            let export_config = config.export.clone();
            let monitor = ResourceMonitor::new();
            let gate = ResourceGate::new(monitor.clone(), config.resource.clone());
            let coordinator = Arc::new(build_coordinator(config));
            spawn_ctrl_c_handler(&coordinator);

            monitor.start();
            let exporter = BatchExporter::new(gate, export_config, parallel);
            let report = exporter
                .export_batch(
                    requests,
                    Arc::new(PipelineExportExecutor::new(coordinator.clone())),
                    Arc::new(ConsoleProgress),
                    &coordinator.cancel_token(),
                )
                .await;
            monitor.stop().await;

            println!(
                "batch finished: {} succeeded, {} failed",
                report.successful.len(),
                report.failed.len()
            );
            for (id, reason) in &report.failed {
                println!("  {id}: {reason}");
            }
        }
    }

    Ok(())
}

fn spawn_ctrl_c_handler(coordinator: &Arc<PipelineCoordinator>) {
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, finishing the current item...");
            coordinator.cancel();
        }
    });
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _guard = clipline::logging::init(None);

    if let Err(e) = run(args).await {
        if e.is_cancelled() {
            eprintln!("cancelled; the checkpoint was preserved for `clipline resume`");
            std::process::exit(130);
        }
        error!(error = %e, "run failed");
        eprintln!("Error: {}", e.user_message());
        std::process::exit(1);
    }
}
