use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use crate::config::EngineConfig;

/// Source of media durations; `None` means unknown
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn probe_duration(&self, path: &Path) -> Option<f64>;
}

/// Duration prober backed by the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    ffprobe_bin: PathBuf,
}

impl FfprobeDuration {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self { ffprobe_bin: cfg.ffprobe_bin.clone() }
    }

    /// Run ffprobe and parse `format=duration`
    pub async fn duration(&self, file_path: &Path) -> Result<f64> {
        if !file_path.exists() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        debug!("ffprobe: probing duration of {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(file_path)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute ffprobe for: {}. Ensure ffprobe is installed and accessible at: {}",
                file_path.display(),
                self.ffprobe_bin.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "ffprobe failed (exit code {}) for {}:\nSTDERR: {}",
                exit_code,
                file_path.display(),
                stderr
            );
        }

        let stdout = String::from_utf8(output.stdout)
            .context("ffprobe output is not valid UTF-8")?;
        parse_duration_output(&stdout)
            .with_context(|| format!("Unusable ffprobe duration for: {}", file_path.display()))
    }
}

#[async_trait]
impl DurationProbe for FfprobeDuration {
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        match self.duration(path).await {
            Ok(secs) => Some(secs),
            Err(e) => {
                debug!("Duration unknown for {}: {:#}", path.display(), e);
                None
            }
        }
    }
}

/// Prober that never knows a duration
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

#[async_trait]
impl DurationProbe for NoProbe {
    async fn probe_duration(&self, _path: &Path) -> Option<f64> {
        None
    }
}

/// Parse the single value printed by `-of default=noprint_wrappers=1:nokey=1`
pub fn parse_duration_output(stdout: &str) -> Result<f64> {
    let value = stdout.trim();
    let secs: f64 = value
        .parse()
        .map_err(|_| anyhow!("not a number: {:?}", value))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("out of range: {}", secs));
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_output() {
        assert!((parse_duration_output("120.024000\n").unwrap() - 120.024).abs() < 1e-9);
        assert!(parse_duration_output("N/A\n").is_err());
        assert!(parse_duration_output("").is_err());
        assert!(parse_duration_output("-3.0").is_err());
        assert!(parse_duration_output("inf").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_unknown() {
        let probe = FfprobeDuration::new(&EngineConfig::default());
        assert_eq!(probe.probe_duration(Path::new("/no/such/chunk_000.mp4")).await, None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("chunk_000.mp3");
        std::fs::write(&media, b"not really audio").unwrap();
        let cfg = EngineConfig {
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe"),
            ..Default::default()
        };
        assert_eq!(FfprobeDuration::new(&cfg).probe_duration(&media).await, None);
    }
}
