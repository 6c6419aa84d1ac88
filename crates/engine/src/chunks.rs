use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;
use crate::progress::ChunkSource;

/// Media extensions the split stage produces
pub const CHUNK_EXTENSIONS: &[&str] = &["mp4", "mp3", "m4a"];

/// Subtitle extensions the transcription stage produces
pub const TRANSCRIPT_EXTENSIONS: &[&str] = &["srt", "vtt", "txt"];

static CHUNK_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^chunk_(\d+)\.(?:mp4|mp3|m4a)$").expect("Invalid regex"));

static TRANSCRIPT_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)chunk[_-]?(\d+)").expect("Invalid regex"));

/// One slice of the split media
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: u32,
    pub path: PathBuf,
}

/// Parse `chunk_<index>.<ext>` into its index
pub fn chunk_index(file_name: &str) -> Option<u32> {
    CHUNK_FILE_RE
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Index embedded in a transcript file name such as `chunk_002.srt` or `chunk-2.vtt`
pub fn transcript_chunk_index(file_name: &str) -> Option<u32> {
    TRANSCRIPT_INDEX_RE
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Files directly inside `dir` (no recursion)
fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Chunk media files in `dir`, ordered by index
pub fn list_chunks(dir: &Path) -> Result<Vec<Chunk>> {
    if !dir.is_dir() {
        anyhow::bail!("Chunk directory does not exist: {}", dir.display());
    }
    let mut chunks: Vec<Chunk> = files_in(dir)
        .into_iter()
        .filter_map(|path| {
            let index = chunk_index(file_name(&path))?;
            Some(Chunk { index, path })
        })
        .collect();
    chunks.sort_by_key(|c| c.index);
    debug!("Found {} chunk(s) in {}", chunks.len(), dir.display());
    Ok(chunks)
}

/// Subtitle files in `dir`, in natural order (`chunk_2` before `chunk_10`)
pub fn list_transcripts(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("Transcript directory does not exist: {}", dir.display());
    }
    let mut files: Vec<PathBuf> = files_in(dir)
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| TRANSCRIPT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort_by(|a, b| natural_cmp(file_name(a), file_name(b)));
    Ok(files)
}

/// Media for chunk `index`: first existing `chunk_<index:03>.<ext>` across `dirs`
pub fn find_chunk_media(dirs: &[PathBuf], index: u32) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| {
            CHUNK_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("chunk_{:03}.{}", index, ext)))
        })
        .find(|candidate| candidate.is_file())
}

/// Compare strings treating digit runs as numbers
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_digits(&mut left);
                let rn = take_digits(&mut right);
                let ord = compare_numeric(&ln, &rn);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}

fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
}

/// Chunk directory on disk, counted on demand
pub struct ChunkDir {
    dir: PathBuf,
}

impl ChunkDir {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl ChunkSource for ChunkDir {
    fn count_chunks(&self) -> Option<usize> {
        if !self.dir.is_dir() {
            return None;
        }
        list_chunks(&self.dir)
            .with_context(|| format!("Failed to list chunks in {}", self.dir.display()))
            .map(|chunks| chunks.len())
            .map_err(|e| warn!("{:#}", e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_chunk_index() {
        assert_eq!(chunk_index("chunk_000.mp3"), Some(0));
        assert_eq!(chunk_index("chunk_012.MP4"), Some(12));
        assert_eq!(chunk_index("chunk_001.wav"), None);
        assert_eq!(chunk_index("xchunk_001.mp3"), None);
    }

    #[test]
    fn test_transcript_chunk_index() {
        assert_eq!(transcript_chunk_index("chunk_003.srt"), Some(3));
        assert_eq!(transcript_chunk_index("Chunk-10.vtt"), Some(10));
        assert_eq!(transcript_chunk_index("chunk7.txt"), Some(7));
        assert_eq!(transcript_chunk_index("notes.txt"), None);
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["chunk_10.srt", "chunk_2.srt", "chunk_1.srt", "Chunk_3.srt"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["chunk_1.srt", "chunk_2.srt", "Chunk_3.srt", "chunk_10.srt"]);
        assert_eq!(natural_cmp("chunk_002", "chunk_2"), Ordering::Equal);
    }

    #[test]
    fn test_listing_and_counting() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["chunk_001.mp3", "chunk_000.mp3", "chunk_002.mp3", "cover.jpg", "chunk_003.wav"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("chunk_004.mp3")).unwrap();

        let chunks = list_chunks(dir.path()).unwrap();
        let indexes: Vec<_> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(chunks[0], Chunk { index: 0, path: dir.path().join("chunk_000.mp3") });

        assert_eq!(ChunkDir::new(dir.path().to_path_buf()).count_chunks(), Some(3));
        assert_eq!(ChunkDir::new(dir.path().join("missing")).count_chunks(), None);
    }

    #[test]
    fn test_transcript_listing_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["chunk_10.srt", "chunk_2.vtt", "chunk_1.txt", "chunk_3.json"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<String> = list_transcripts(dir.path())
            .unwrap()
            .iter()
            .map(|p| file_name(p).to_string())
            .collect();
        assert_eq!(names, vec!["chunk_1.txt", "chunk_2.vtt", "chunk_10.srt"]);
    }

    #[test]
    fn test_find_chunk_media_searches_dirs_in_order() {
        let job = tempfile::tempdir().unwrap();
        let legacy = tempfile::tempdir().unwrap();
        fs::write(legacy.path().join("chunk_001.mp4"), b"").unwrap();
        fs::write(job.path().join("chunk_001.mp3"), b"").unwrap();
        let dirs = vec![job.path().to_path_buf(), legacy.path().to_path_buf()];

        assert_eq!(find_chunk_media(&dirs, 1), Some(job.path().join("chunk_001.mp3")));
        assert_eq!(find_chunk_media(&dirs, 2), None);
    }
}
