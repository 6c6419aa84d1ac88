//! Reconstruction of a job's global transcript timeline.
//!
//! Every transcript file holds times relative to the start of its own chunk.
//! Files are walked in natural order while a running offset converts those
//! times to absolute ones. The offset grows by the probed duration of the
//! chunk's media when known; otherwise it advances to the latest segment end
//! seen in the file, and never moves backwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::chunks::{find_chunk_media, list_transcripts, transcript_chunk_index};
use crate::config::LegacyScope;
use crate::layout::JobLayout;
use crate::probe::DurationProbe;
use crate::subtitle::{format_display, format_precise, parse_blocks, parse_timestamp, scan_raw_output};

/// Characters of text that take part in duplicate detection
const DEDUPE_TEXT_CHARS: usize = 200;

/// Segment on the absolute timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub start: String,
    pub end: String,
    pub text: String,
    pub start_sec: f64,
    pub end_sec: f64,
}

impl TranscriptSegment {
    fn new(start_sec: f64, end_sec: f64, text: String) -> Self {
        Self {
            start: format_precise(start_sec),
            end: format_precise(end_sec),
            text,
            start_sec,
            end_sec,
        }
    }

    fn dedupe_key(&self) -> (i64, i64, String) {
        (
            (self.start_sec * 1000.0).round() as i64,
            (self.end_sec * 1000.0).round() as i64,
            self.text.chars().take(DEDUPE_TEXT_CHARS).collect(),
        )
    }
}

/// Links to the job's media, as served by the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUrls {
    pub file: String,
    pub presentation: String,
    pub thumbnail: String,
}

impl MediaUrls {
    pub fn for_job(base_url: &str, job_id: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            file: format!("{}/jobs/{}/file", base, job_id),
            presentation: format!("{}/jobs/{}/presentation", base, job_id),
            thumbnail: format!("{}/jobs/{}/thumbnail", base, job_id),
        }
    }
}

/// Ordered, deduplicated transcript of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub job_id: String,
    pub urls: MediaUrls,
    pub segments: Vec<TranscriptSegment>,
}

/// Where a job's transcript comes from
#[derive(Debug, Clone)]
pub enum TimelineSource<'a> {
    /// Subtitle directory plus the directories holding chunk media
    Directory { transcripts_dir: PathBuf, chunk_dirs: Vec<PathBuf> },
    /// Captured pipeline stdout
    RawOutput(&'a str),
    Empty,
}

impl<'a> TimelineSource<'a> {
    /// Pick the job's transcript directory, the legacy one, or its captured output
    pub fn resolve(layout: &JobLayout, legacy: Option<&LegacyScope>, stdout: &'a str) -> Self {
        if let Some(transcripts_dir) = layout.resolve_transcripts_dir(legacy) {
            return TimelineSource::Directory {
                transcripts_dir,
                chunk_dirs: layout.chunk_search_dirs(legacy),
            };
        }
        if stdout.is_empty() {
            TimelineSource::Empty
        } else {
            TimelineSource::RawOutput(stdout)
        }
    }
}

/// Builds timelines, probing chunk durations through `probe`
pub struct Reconstructor<'p> {
    probe: &'p dyn DurationProbe,
}

impl<'p> Reconstructor<'p> {
    pub fn new(probe: &'p dyn DurationProbe) -> Self {
        Self { probe }
    }

    pub async fn build(&self, job_id: &str, urls: MediaUrls, source: TimelineSource<'_>) -> Result<Timeline> {
        let segments = match source {
            TimelineSource::Directory { transcripts_dir, chunk_dirs } => {
                self.from_directory(&transcripts_dir, &chunk_dirs).await?
            }
            TimelineSource::RawOutput(output) => from_raw_output(output),
            TimelineSource::Empty => Vec::new(),
        };
        let segments = finalize(segments);
        info!("Job {}: timeline has {} segment(s)", job_id, segments.len());
        Ok(Timeline {
            job_id: job_id.to_string(),
            urls,
            segments,
        })
    }

    /// Absolute segments from every subtitle file in `dir`, in file order
    pub async fn from_directory(&self, dir: &Path, chunk_dirs: &[PathBuf]) -> Result<Vec<TranscriptSegment>> {
        let files = list_transcripts(dir)
            .with_context(|| format!("Failed to list transcripts in {}", dir.display()))?;
        debug!("Reconstructing from {} transcript file(s) in {}", files.len(), dir.display());

        let mut segments = Vec::new();
        let mut offset = 0.0_f64;
        // latest segment end over every file read so far
        let mut latest_end = 0.0_f64;

        for file in files {
            let file_offset = offset;
            let duration = self.chunk_duration(&file, chunk_dirs).await;

            let content = match tokio::fs::read(&file).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!("Skipping unreadable transcript {}: {}", file.display(), e);
                    String::new()
                }
            };

            for cue in parse_blocks(&content) {
                let segment = TranscriptSegment::new(cue.start + file_offset, cue.end + file_offset, cue.text);
                latest_end = latest_end.max(segment.end_sec);
                segments.push(segment);
            }

            offset = next_offset(offset, duration, latest_end);
        }

        Ok(segments)
    }

    async fn chunk_duration(&self, transcript: &Path, chunk_dirs: &[PathBuf]) -> Option<f64> {
        let name = transcript.file_name()?.to_str()?;
        let index = transcript_chunk_index(name)?;
        let media = find_chunk_media(chunk_dirs, index)?;
        let duration = self.probe.probe_duration(&media).await;
        debug!("Chunk {} ({}) duration: {:?}", index, media.display(), duration);
        duration
    }
}

/// Offset for the file after this one
fn next_offset(offset: f64, probed_duration: Option<f64>, latest_end: f64) -> f64 {
    match probed_duration {
        Some(duration) => offset + duration,
        None => offset.max(latest_end),
    }
}

/// Segments recovered from captured stdout; times are already absolute
pub fn from_raw_output(output: &str) -> Vec<TranscriptSegment> {
    scan_raw_output(output)
        .into_iter()
        .map(|cue| {
            let start = parse_timestamp(&cue.start).unwrap_or(0.0);
            let end = parse_timestamp(&cue.end).unwrap_or(0.0);
            TranscriptSegment::new(start, end, cue.text)
        })
        .collect()
}

/// Drop exact duplicates, sort by start and render display times
pub fn finalize(segments: Vec<TranscriptSegment>) -> Vec<TranscriptSegment> {
    let mut seen = HashSet::new();
    let mut unique: Vec<TranscriptSegment> = segments
        .into_iter()
        .filter(|segment| seen.insert(segment.dedupe_key()))
        .collect();

    unique.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));

    for segment in &mut unique {
        segment.start = format_display(segment.start_sec);
        segment.end = format_display(segment.end_sec);
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use crate::probe::NoProbe;

    struct MapProbe(HashMap<PathBuf, f64>);

    #[async_trait]
    impl DurationProbe for MapProbe {
        async fn probe_duration(&self, path: &Path) -> Option<f64> {
            self.0.get(path).copied()
        }
    }

    fn urls() -> MediaUrls {
        MediaUrls::for_job("http://host/", "job1")
    }

    fn srt(cues: &[(f64, f64, &str)]) -> String {
        cues.iter()
            .enumerate()
            .map(|(i, (s, e, t))| format!("{}\n{} --> {}\n{}\n\n", i + 1, format_precise(*s), format_precise(*e), t))
            .collect()
    }

    fn segment(start_sec: f64, end_sec: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment::new(start_sec, end_sec, text.to_string())
    }

    #[tokio::test]
    async fn test_probed_durations_offset_later_chunks() {
        let job = tempfile::tempdir().unwrap();
        let chunks = job.path().join("chunks");
        let transcripts = job.path().join("transcripts");
        fs::create_dir_all(&chunks).unwrap();
        fs::create_dir_all(&transcripts).unwrap();
        fs::write(chunks.join("chunk_000.mp4"), b"").unwrap();
        fs::write(chunks.join("chunk_001.mp4"), b"").unwrap();
        fs::write(transcripts.join("chunk_000.srt"), "1\n00:00:01,000 --> 00:00:02,500\nHola\n\n").unwrap();
        fs::write(transcripts.join("chunk_001.srt"), "1\n00:00:00,500 --> 00:00:01,000\nMundo\n\n").unwrap();

        let probe = MapProbe(HashMap::from([
            (chunks.join("chunk_000.mp4"), 120.0),
            (chunks.join("chunk_001.mp4"), 45.0),
        ]));
        let source = TimelineSource::Directory { transcripts_dir: transcripts, chunk_dirs: vec![chunks] };
        let timeline = Reconstructor::new(&probe).build("job1", urls(), source).await.unwrap();

        assert_eq!(
            timeline.segments,
            vec![
                TranscriptSegment {
                    start: "00:00:01".into(),
                    end: "00:00:02".into(),
                    text: "Hola".into(),
                    start_sec: 1.0,
                    end_sec: 2.5,
                },
                TranscriptSegment {
                    start: "00:02:00".into(),
                    end: "00:02:01".into(),
                    text: "Mundo".into(),
                    start_sec: 120.5,
                    end_sec: 121.0,
                },
            ]
        );
        assert_eq!(timeline.urls.file, "http://host/jobs/job1/file");
    }

    #[tokio::test]
    async fn test_numeric_file_order_and_segment_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chunk_10.srt"), srt(&[(1.0, 2.0, "third")])).unwrap();
        fs::write(dir.path().join("chunk_2.srt"), srt(&[(0.0, 30.0, "second")])).unwrap();
        fs::write(dir.path().join("chunk_1.srt"), srt(&[(0.0, 10.0, "first"), (10.0, 50.0, "first b")])).unwrap();

        let segments = Reconstructor::new(&NoProbe).from_directory(dir.path(), &[]).await.unwrap();
        let got: Vec<_> = segments.iter().map(|s| (s.text.as_str(), s.start_sec, s.end_sec)).collect();
        assert_eq!(
            got,
            vec![
                ("first", 0.0, 10.0),
                ("first b", 10.0, 50.0),
                ("second", 50.0, 80.0),
                ("third", 81.0, 82.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_file_keeps_offset() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chunk_1.srt"), srt(&[(0.0, 40.0, "a")])).unwrap();
        fs::write(dir.path().join("chunk_2.srt"), "garbage only\n").unwrap();
        fs::write(dir.path().join("chunk_3.srt"), srt(&[(5.0, 6.0, "c")])).unwrap();

        let segments = Reconstructor::new(&NoProbe).from_directory(dir.path(), &[]).await.unwrap();
        assert_eq!(segments.last().map(|s| s.start_sec), Some(45.0));
    }

    #[tokio::test]
    async fn test_unprobed_chunk_starts_after_latest_cue_of_earlier_chunks() {
        let job = tempfile::tempdir().unwrap();
        let chunks = job.path().join("chunks");
        let transcripts = job.path().join("transcripts");
        fs::create_dir_all(&chunks).unwrap();
        fs::create_dir_all(&transcripts).unwrap();
        fs::write(chunks.join("chunk_000.mp4"), b"").unwrap();
        // cue runs past the probed length of its chunk
        fs::write(transcripts.join("chunk_000.srt"), srt(&[(0.0, 12.0, "one")])).unwrap();
        fs::write(transcripts.join("chunk_001.srt"), "").unwrap();
        fs::write(transcripts.join("chunk_002.srt"), srt(&[(0.0, 1.0, "three")])).unwrap();

        let probe = MapProbe(HashMap::from([(chunks.join("chunk_000.mp4"), 10.0)]));
        let segments = Reconstructor::new(&probe).from_directory(&transcripts, &[chunks]).await.unwrap();
        let got: Vec<_> = segments.iter().map(|s| (s.text.as_str(), s.start_sec)).collect();
        assert_eq!(got, vec![("one", 0.0), ("three", 12.0)]);
    }

    #[tokio::test]
    async fn test_raw_output_fallback_matches_directory_format() {
        let stdout = "1. Dividiendo...\n[00:00:01.000 --> 00:00:02.500] Hola\n[00:01.000 --> 00:02.500] Hola\n[02:00.500 --> 02:01.000] Mundo\n";
        let timeline = Reconstructor::new(&NoProbe)
            .build("job1", urls(), TimelineSource::RawOutput(stdout))
            .await
            .unwrap();
        assert_eq!(timeline.segments.len(), 2);
        assert_eq!(timeline.segments[0].start, "00:00:01");
        assert_eq!(timeline.segments[1].start, "00:02:00");
        assert_eq!(timeline.segments[1].end_sec, 121.0);
    }

    #[test]
    fn test_resolve_source() {
        let root = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(root.path(), "j");
        assert!(matches!(TimelineSource::resolve(&layout, None, ""), TimelineSource::Empty));
        assert!(matches!(TimelineSource::resolve(&layout, None, "x"), TimelineSource::RawOutput("x")));

        fs::create_dir_all(layout.transcripts_dir()).unwrap();
        match TimelineSource::resolve(&layout, None, "x") {
            TimelineSource::Directory { transcripts_dir, chunk_dirs } => {
                assert_eq!(transcripts_dir, layout.transcripts_dir());
                assert_eq!(chunk_dirs, vec![layout.chunks_dir()]);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_finalize_dedupes_on_rounded_key() {
        let long_a = format!("{}A", "x".repeat(200));
        let long_b = format!("{}B", "x".repeat(200));
        let out = finalize(vec![
            segment(5.0, 6.0, "b"),
            segment(1.0, 2.0, "a"),
            segment(1.0001, 2.0002, "a"),
            segment(3.0, 4.0, &long_a),
            segment(3.0, 4.0, &long_b),
        ]);
        let texts: Vec<_> = out.iter().map(|s| s.text.chars().last().unwrap()).collect();
        assert_eq!(texts, vec!['a', 'A', 'b']);
    }

    fn cue() -> impl Strategy<Value = (f64, f64)> {
        (0u32..600_000, 0u32..30_000).prop_map(|(start_ms, len_ms)| {
            let start = start_ms as f64 / 1000.0;
            (start, start + len_ms as f64 / 1000.0)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_finalized_timeline_sorted_and_unique(
            raw in prop::collection::vec((cue(), prop_oneof![Just("a"), Just("b"), Just("c")]), 0..60),
        ) {
            let mut input: Vec<_> = raw.iter().map(|((s, e), t)| segment(*s, *e, t)).collect();
            // duplicates on purpose
            input.extend(input.clone().into_iter().take(10));
            let out = finalize(input);

            for pair in out.windows(2) {
                prop_assert!(pair[0].start_sec <= pair[1].start_sec);
            }
            let keys: HashSet<_> = out.iter().map(|s| s.dedupe_key()).collect();
            prop_assert_eq!(keys.len(), out.len());
        }

        #[test]
        fn test_unprobed_offsets_never_decrease(
            files in prop::collection::vec(prop::collection::vec(cue(), 0..5), 1..6),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut expected = Vec::new();
            let mut offset = 0.0_f64;
            for (i, cues) in files.iter().enumerate() {
                let named: Vec<(f64, f64, &str)> = cues.iter().map(|(s, e)| (*s, *e, "t")).collect();
                fs::write(dir.path().join(format!("chunk_{}.srt", i)), srt(&named)).unwrap();
                let max_end = cues
                    .iter()
                    .map(|(_, e)| (e * 1000.0).round() / 1000.0 + offset)
                    .fold(f64::NEG_INFINITY, f64::max);
                for (s, _) in cues {
                    expected.push(offset + (s * 1000.0).round() / 1000.0);
                }
                let next = offset.max(max_end);
                prop_assert!(next >= offset && next >= 0.0);
                offset = next;
            }

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let segments = rt.block_on(Reconstructor::new(&NoProbe).from_directory(dir.path(), &[])).unwrap();
            let starts: Vec<f64> = segments.iter().map(|s| s.start_sec).collect();
            prop_assert_eq!(starts.len(), expected.len());
            for (got, want) in starts.iter().zip(expected.iter()) {
                prop_assert!((got - want).abs() < 1e-6, "got {} want {}", got, want);
            }
        }
    }
}
