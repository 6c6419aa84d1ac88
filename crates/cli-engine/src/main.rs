use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::{
    live::{self, LiveEvent},
    Engine, EngineConfig, Job, JobRequest, JobStatus,
};
use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

/// Talk transcription pipeline runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job from a recording and its slides, then run it
    Submit {
        media: PathBuf,
        presentation: PathBuf,

        /// Workspace the job belongs to
        #[arg(long, value_name = "ID")]
        workspace: Option<String>,

        /// Print live events as server-sent events instead of raw output
        #[arg(long)]
        stream: bool,
    },
    /// Print the persisted state of a job
    Status { job_id: String },
    /// List all jobs, newest first
    List,
    /// Print the reconstructed transcript timeline of a job
    Timeline { job_id: String },
    /// Mark jobs abandoned by a previous run as errored
    Recover,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    let cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let engine = Engine::new(cfg).context("Failed to initialise engine")?;

    match args.command {
        Command::Submit { media, presentation, workspace, stream } => {
            let request = JobRequest {
                media,
                presentation,
                workspace_id: workspace,
            };
            submit(&engine, &request, stream).await
        }
        Command::Status { job_id } => {
            let job = engine.job(&job_id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let jobs = engine.jobs().context("Failed to load jobs")?;
            print_jobs(&jobs);
            Ok(ExitCode::SUCCESS)
        }
        Command::Timeline { job_id } => {
            let timeline = engine.timeline(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&timeline)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Recover => {
            let recovered = engine
                .recover_stale_jobs(Utc::now())
                .context("Failed to recover stale jobs")?;
            if recovered.is_empty() {
                info!("No stale jobs found");
            }
            for id in &recovered {
                println!("{}", id);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn submit(engine: &Engine, request: &JobRequest, stream: bool) -> Result<ExitCode> {
    let job = engine.create_job(request).context("Failed to create job")?;
    let job_id = job.id.clone();
    info!("Job {}: submitted", job_id);

    let (tx, rx) = live::channel();
    let printer = tokio::spawn(print_events(rx, stream));

    let run = engine.run_job(job, Some(tx));
    tokio::pin!(run);
    let finished = tokio::select! {
        result = &mut run => result.with_context(|| format!("Job {} did not complete", job_id))?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Job {}: interrupted, stopping pipeline", job_id);
            engine.shutdown().await?;
            return Ok(ExitCode::from(130));
        }
    };

    if let Err(e) = printer.await {
        warn!("Output printer failed: {}", e);
    }

    info!(
        "Job {}: {} (progress {}%, {}/{} chunks)",
        finished.id,
        finished.status,
        finished.progress(),
        finished.tracking.transcribed_chunks,
        chunk_total(&finished)
    );
    if finished.status == JobStatus::Done {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn print_events(mut rx: UnboundedReceiver<LiveEvent>, stream: bool) {
    let stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        let mut out = stdout.lock();
        let written = if stream {
            write!(out, "{}", event.to_sse())
        } else {
            match &event {
                LiveEvent::Output { text } => write!(out, "{}", text),
                LiveEvent::Done { .. } => Ok(()),
                LiveEvent::Error { message } => {
                    error!("Pipeline could not be started: {}", message);
                    Ok(())
                }
            }
        };
        // a closed stdout must not stop the job, keep draining
        let _ = written.and_then(|_| out.flush());
    }
}

fn chunk_total(job: &Job) -> String {
    job.tracking
        .total_chunks
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    println!("{:<22} {:<8} {:>5} {:>7} {:<6} MEDIA", "JOB", "STATUS", "PROG", "CHUNKS", "THUMB");
    for job in jobs {
        let media = job
            .media
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.media.display().to_string());
        println!(
            "{:<22} {:<8} {:>4}% {:>7} {:<6} {}",
            job.id,
            job.status.as_str(),
            job.progress(),
            format!("{}/{}", job.tracking.transcribed_chunks, chunk_total(job)),
            if job.thumbnail.thumbnail_exists { "yes" } else { "no" },
            media
        );
    }
}
