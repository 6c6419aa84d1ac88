use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the talk pipeline engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory holding one sub-directory per job
    pub jobs_root: PathBuf,
    /// Program that runs the split -> transcribe -> evaluate pipeline
    pub pipeline_program: PathBuf,
    /// Arguments placed before `<media> <presentation> <jobId>`
    pub pipeline_args: Vec<String>,
    /// Working directory for the pipeline process (current dir when unset)
    pub pipeline_workdir: Option<PathBuf>,
    /// Path to the ffmpeg binary used for thumbnails
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary used for duration probing
    pub ffprobe_bin: PathBuf,
    /// Seek offset passed to ffmpeg `-ss` for the thumbnail frame
    pub thumbnail_offset: String,
    /// Thumbnail width in pixels (height keeps aspect ratio)
    pub thumbnail_width: u32,
    /// Base URL used when building media links in timeline output
    pub public_base_url: String,
    /// Age after which a queued/running job without a live process counts as interrupted
    pub stale_job_secs: u64,
    /// Shared chunk/transcript directories used when a job has none of its own
    pub legacy_scope: Option<LegacyScope>,
}

/// Default (pre per-job layout) directories for chunks and transcripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyScope {
    pub chunks_dir: PathBuf,
    pub transcripts_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            jobs_root: PathBuf::from("jobs"),
            pipeline_program: PathBuf::from("node"),
            pipeline_args: vec!["automate.js".to_string()],
            pipeline_workdir: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            thumbnail_offset: "00:00:01".to_string(),
            thumbnail_width: 320,
            public_base_url: "http://localhost:3000".to_string(),
            stale_job_secs: 6 * 60 * 60,
            legacy_scope: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }
}
