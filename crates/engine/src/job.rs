use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::StateError;
use crate::layout::JobLayout;
use crate::progress::ProgressState;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Error,
}

impl JobStatus {
    /// Terminal states are never left again
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields owned by the thumbnail side-job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailState {
    #[serde(default)]
    pub thumbnail_exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_error: Option<String>,
}

/// One submission of a recording plus its slide deck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "jobId")]
    pub id: String,
    pub media: PathBuf,
    pub presentation: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    /// Process driving the job; recovery leaves jobs with a live owner alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub tracking: ProgressState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Spawn failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub thumbnail: ThumbnailState,
}

impl Job {
    /// Create a queued job for the given media and presentation
    pub fn new(id: impl Into<String>, media: PathBuf, presentation: PathBuf) -> Self {
        Self {
            id: id.into(),
            media,
            presentation,
            workspace_id: None,
            owner_pid: None,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            tracking: ProgressState::default(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            thumbnail: ThumbnailState::default(),
        }
    }

    pub fn progress(&self) -> u8 {
        self.tracking.progress
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Generate a job id of the form `<unix millis>-<6 hex chars>`
pub fn new_job_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..6])
}

/// Persist a job record atomically (temp file + rename)
pub fn save_job(job: &Job, jobs_root: &Path) -> Result<()> {
    let layout = JobLayout::new(jobs_root, &job.id);
    fs::create_dir_all(layout.dir())
        .with_context(|| format!("Failed to create job directory: {}", layout.dir().display()))?;

    let path = layout.metadata_path();
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(job)
        .with_context(|| format!("Failed to serialize job {}", job.id))?;
    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write job state: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to move job state into place: {}", path.display()))?;
    Ok(())
}

/// Load one job record, telling "missing" apart from "unreadable"
pub fn load_job(jobs_root: &Path, job_id: &str) -> Result<Job, StateError> {
    let path = JobLayout::new(jobs_root, job_id).metadata_path();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::NotFound { path });
        }
        Err(source) => return Err(StateError::Io { path, source }),
    };
    serde_json::from_str(&content).map_err(|e| StateError::Invalid {
        path,
        message: e.to_string(),
    })
}

/// Load every readable job under `jobs_root`; invalid records are skipped
pub fn load_all_jobs(jobs_root: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if !jobs_root.exists() {
        return Ok(jobs);
    }

    let entries = fs::read_dir(jobs_root)
        .with_context(|| format!("Failed to read jobs directory: {}", jobs_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", jobs_root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(job_id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        match load_job(jobs_root, &job_id) {
            Ok(job) => jobs.push(job),
            Err(StateError::NotFound { .. }) => {}
            Err(e) => warn!("Skipping job {}: {}", job_id, e),
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_uses_camel_case_fields() {
        let root = tempfile::tempdir().unwrap();
        let mut job = Job::new("1-abcdef", PathBuf::from("talk.mp4"), PathBuf::from("deck.pdf"));
        job.tracking.total_chunks = Some(3);
        job.tracking.transcribed_chunk_names.insert("chunk_000.mp4".to_string());
        job.tracking.transcribed_chunks = 1;
        save_job(&job, root.path()).unwrap();

        let raw = fs::read_to_string(root.path().join("1-abcdef/metadata.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["jobId"], "1-abcdef");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["totalChunks"], 3);
        assert_eq!(value["transcribedChunkNames"][0], "chunk_000.mp4");
        assert_eq!(value["thumbnailExists"], false);

        let loaded = load_job(root.path(), "1-abcdef").unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn test_missing_and_invalid_are_distinct() {
        let root = tempfile::tempdir().unwrap();
        let err = load_job(root.path(), "nope").unwrap_err();
        assert!(err.is_not_found());

        fs::create_dir_all(root.path().join("broken")).unwrap();
        fs::write(root.path().join("broken/metadata.json"), "{\"jobId\":").unwrap();
        let err = load_job(root.path(), "broken").unwrap_err();
        assert!(matches!(err, StateError::Invalid { .. }));
    }

    #[test]
    fn test_load_all_skips_invalid_records() {
        let root = tempfile::tempdir().unwrap();
        save_job(&Job::new("a", "a.mp3".into(), "a.pdf".into()), root.path()).unwrap();
        save_job(&Job::new("b", "b.mp3".into(), "b.pdf".into()), root.path()).unwrap();
        fs::create_dir_all(root.path().join("c")).unwrap();
        fs::write(root.path().join("c/metadata.json"), "garbage").unwrap();
        fs::create_dir_all(root.path().join("empty")).unwrap();

        let mut ids: Vec<_> = load_all_jobs(root.path()).unwrap().into_iter().map(|j| j.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_record_from_older_writer_loads() {
        // Only the fields written at submission time
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("old")).unwrap();
        fs::write(
            root.path().join("old/metadata.json"),
            r#"{"jobId":"old","media":"jobs/old/a.mp3","presentation":"jobs/old/a.pdf",
                "status":"queued","createdAt":"2024-05-01T10:00:00Z","thumbnailExists":false}"#,
        )
        .unwrap();
        let job = load_job(root.path(), "old").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress(), 0);
        assert!(job.tracking.transcribed_chunk_names.is_empty());
    }

    #[test]
    fn test_job_id_shape() {
        let id = new_job_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 6);
    }
}
