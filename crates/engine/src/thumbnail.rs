use std::path::{Path, PathBuf};
use std::process::Stdio;
use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::process::Command;
use tokio::task::JoinHandle;
use crate::config::EngineConfig;
use crate::job::ThumbnailState;
use crate::store::JobWriter;

/// Result of one thumbnail extraction attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ThumbnailOutcome {
    Created { at: DateTime<Utc> },
    Failed { error: String },
}

impl ThumbnailOutcome {
    /// Write this outcome into the thumbnail fields of a job
    pub fn apply(&self, state: &mut ThumbnailState) {
        match self {
            ThumbnailOutcome::Created { at } => {
                state.thumbnail_exists = true;
                state.thumbnail_created_at = Some(*at);
                state.thumbnail_error = None;
            }
            ThumbnailOutcome::Failed { error } => {
                state.thumbnail_exists = false;
                state.thumbnail_error = Some(error.clone());
            }
        }
    }
}

/// One-shot preview frame extraction, independent of the pipeline
#[derive(Debug, Clone)]
pub struct ThumbnailJob {
    ffmpeg_bin: PathBuf,
    offset: String,
    width: u32,
}

impl ThumbnailJob {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            offset: cfg.thumbnail_offset.clone(),
            width: cfg.thumbnail_width,
        }
    }

    /// ffmpeg arguments: seek, grab one frame, scale to width keeping aspect
    pub fn build_args(&self, media: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-ss".to_string(),
            self.offset.clone(),
            "-i".to_string(),
            media.display().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            "-vf".to_string(),
            format!("scale={}:-1", self.width),
            output.display().to_string(),
        ]
    }

    /// Run ffmpeg once; never retried
    pub async fn run(&self, media: &Path, output: &Path) -> ThumbnailOutcome {
        let status = Command::new(&self.ffmpeg_bin)
            .args(self.build_args(media, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() && output.is_file() => {
                ThumbnailOutcome::Created { at: Utc::now() }
            }
            Ok(status) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "null".to_string());
                ThumbnailOutcome::Failed { error: format!("ffmpeg exit {}", code) }
            }
            Err(e) => ThumbnailOutcome::Failed { error: e.to_string() },
        }
    }

    /// Run in the background and record the outcome through `writer`
    pub fn spawn(self, writer: JobWriter, media: PathBuf, output: PathBuf) -> JoinHandle<ThumbnailOutcome> {
        tokio::spawn(async move {
            let outcome = self.run(&media, &output).await;
            match &outcome {
                ThumbnailOutcome::Created { .. } => {
                    info!("Job {}: thumbnail written to {}", writer.job_id(), output.display())
                }
                ThumbnailOutcome::Failed { error } => {
                    warn!("Job {}: thumbnail failed: {}", writer.job_id(), error)
                }
            }

            let recorded = outcome.clone();
            if let Err(e) = writer.update(move |job| recorded.apply(&mut job.thumbnail)).await {
                warn!("Job {}: could not record thumbnail outcome: {:#}", writer.job_id(), e);
            }
            outcome
        })
    }
}
