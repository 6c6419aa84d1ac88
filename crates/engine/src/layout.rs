use std::path::{Path, PathBuf};
use crate::config::LegacyScope;

const METADATA_FILE: &str = "metadata.json";
const CHUNKS_DIR: &str = "chunks";
const TRANSCRIPTS_DIR: &str = "transcripts";
const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// On-disk layout of a single job directory
///
/// ```text
/// <jobs_root>/<job_id>/
///     metadata.json
///     thumbnail.jpg
///     chunks/chunk_000.mp4 ...
///     transcripts/chunk_000.srt ...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    dir: PathBuf,
}

impl JobLayout {
    pub fn new(jobs_root: &Path, job_id: &str) -> Self {
        Self { dir: jobs_root.join(job_id) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_DIR)
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.dir.join(TRANSCRIPTS_DIR)
    }

    pub fn thumbnail_path(&self) -> PathBuf {
        self.dir.join(THUMBNAIL_FILE)
    }

    /// Transcript directory to reconstruct from: the job's own, then the legacy one
    pub fn resolve_transcripts_dir(&self, legacy: Option<&LegacyScope>) -> Option<PathBuf> {
        let own = self.transcripts_dir();
        if own.is_dir() {
            return Some(own);
        }
        legacy
            .map(|scope| scope.transcripts_dir.clone())
            .filter(|dir| dir.is_dir())
    }

    /// Directories searched, in order, for the media of a transcribed chunk
    pub fn chunk_search_dirs(&self, legacy: Option<&LegacyScope>) -> Vec<PathBuf> {
        let mut dirs = vec![self.chunks_dir()];
        if let Some(scope) = legacy {
            dirs.push(scope.chunks_dir.clone());
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = JobLayout::new(Path::new("/srv/jobs"), "17-abc");
        assert_eq!(layout.metadata_path(), PathBuf::from("/srv/jobs/17-abc/metadata.json"));
        assert_eq!(layout.chunks_dir(), PathBuf::from("/srv/jobs/17-abc/chunks"));
        assert_eq!(layout.thumbnail_path(), PathBuf::from("/srv/jobs/17-abc/thumbnail.jpg"));
    }

    #[test]
    fn test_transcripts_dir_prefers_job_then_legacy() {
        let root = tempfile::tempdir().unwrap();
        let legacy_dir = root.path().join("transcripts");
        std::fs::create_dir_all(&legacy_dir).unwrap();
        let scope = LegacyScope {
            chunks_dir: root.path().join("chunks"),
            transcripts_dir: legacy_dir.clone(),
        };

        let layout = JobLayout::new(&root.path().join("jobs"), "j1");
        assert_eq!(layout.resolve_transcripts_dir(None), None);
        assert_eq!(layout.resolve_transcripts_dir(Some(&scope)), Some(legacy_dir));

        std::fs::create_dir_all(layout.transcripts_dir()).unwrap();
        assert_eq!(layout.resolve_transcripts_dir(Some(&scope)), Some(layout.transcripts_dir()));
    }
}
