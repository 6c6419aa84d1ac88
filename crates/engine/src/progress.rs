//! Progress inference from free-text pipeline output.
//!
//! The pipeline does not emit structured progress; it prints prose. The
//! recognised phrases live in a versioned [`PatternTable`] so the contract with
//! the external tools is explicit and can be tested on its own. Each entry maps
//! a milestone to a matcher; [`advance`] turns detected milestones into a new
//! [`ProgressState`].

use std::collections::BTreeSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Progress reported once the split stage finishes
pub const SPLIT_PROGRESS: u8 = 10;
/// Progress reported once evaluation starts
pub const EVALUATION_PROGRESS: u8 = 92;
/// Progress reported for a finished job
pub const DONE_PROGRESS: u8 = 100;

/// Progress-related part of a job record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub total_chunks: Option<usize>,
    #[serde(default)]
    pub transcribed_chunk_names: BTreeSet<String>,
    #[serde(default)]
    pub transcribed_chunks: usize,
}

impl ProgressState {
    /// Progress can only move forward
    fn raise_to(&mut self, value: u8) {
        self.progress = self.progress.max(value.min(DONE_PROGRESS));
    }

    fn transcribe_progress(&self) -> u8 {
        let done = self.transcribed_chunks;
        match self.total_chunks {
            Some(total) if total > 0 => {
                let ratio = done as f64 / total as f64;
                (2.0 + 88.0 * ratio).round().clamp(0.0, 100.0) as u8
            }
            _ => (done * 10 + 10).min(90) as u8,
        }
    }
}

/// Read-only view of the chunk directory the split stage writes to
pub trait ChunkSource {
    /// Number of chunk media files, or `None` when the directory does not exist
    fn count_chunks(&self) -> Option<usize>;
}

/// No chunk directory available
pub struct NoChunks;

impl ChunkSource for NoChunks {
    fn count_chunks(&self) -> Option<usize> {
        None
    }
}

/// Recognisable events in pipeline output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    SplitComplete,
    ChunkTranscribed,
    EvaluationStarted,
}

/// One detected milestone occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    SplitComplete,
    ChunkTranscribed(String),
    EvaluationStarted,
}

/// Milestone name, matcher and the milestone it feeds
pub struct MilestonePattern {
    pub name: &'static str,
    pub milestone: Milestone,
    matcher: Regex,
}

/// Versioned set of milestone patterns
pub struct PatternTable {
    pub version: u32,
    patterns: Vec<MilestonePattern>,
}

static V1: Lazy<PatternTable> = Lazy::new(PatternTable::v1);

impl PatternTable {
    /// Phrases printed by the current split/transcribe/evaluate scripts
    pub fn v1() -> Self {
        let pattern = |name, milestone, re: &str| MilestonePattern {
            name,
            milestone,
            matcher: Regex::new(re).expect("milestone pattern must compile"),
        };
        Self {
            version: 1,
            patterns: vec![
                pattern(
                    "split-complete",
                    Milestone::SplitComplete,
                    r"(?i)archivo dividido exitosamente|split (?:completed|succeeded)",
                ),
                pattern(
                    "chunk-transcribed",
                    Milestone::ChunkTranscribed,
                    r"(?i)(?:transcripci[oó]n completada para|transcription completed for)\s+(chunk_\d+\.(?:mp4|mp3|m4a))",
                ),
                pattern(
                    "evaluation-started",
                    Milestone::EvaluationStarted,
                    r"(?i)evaluando transcripciones|3\. evaluando|evaluating transcripts",
                ),
            ],
        }
    }

    /// Table used by [`advance`]
    pub fn current() -> &'static PatternTable {
        &V1
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.patterns.iter().map(|p| p.name)
    }

    /// All milestones found in `text`, in table order
    pub fn detect(&self, text: &str) -> Vec<Signal> {
        let mut signals = Vec::new();
        for pattern in &self.patterns {
            match pattern.milestone {
                Milestone::SplitComplete => {
                    if pattern.matcher.is_match(text) {
                        signals.push(Signal::SplitComplete);
                    }
                }
                Milestone::ChunkTranscribed => {
                    for caps in pattern.matcher.captures_iter(text) {
                        if let Some(name) = caps.get(1) {
                            signals.push(Signal::ChunkTranscribed(name.as_str().to_string()));
                        }
                    }
                }
                Milestone::EvaluationStarted => {
                    if pattern.matcher.is_match(text) {
                        signals.push(Signal::EvaluationStarted);
                    }
                }
            }
        }
        signals
    }
}

/// Compute the state that follows `current` after observing `text`
pub fn advance(current: &ProgressState, text: &str, chunks: &dyn ChunkSource) -> ProgressState {
    advance_with(PatternTable::current(), current, text, chunks)
}

pub fn advance_with(
    table: &PatternTable,
    current: &ProgressState,
    text: &str,
    chunks: &dyn ChunkSource,
) -> ProgressState {
    let mut next = current.clone();
    for signal in table.detect(text) {
        apply(&mut next, signal, chunks);
    }
    next
}

fn apply(state: &mut ProgressState, signal: Signal, chunks: &dyn ChunkSource) {
    match signal {
        Signal::SplitComplete => {
            if state.total_chunks.is_none() {
                // zero chunks is indistinguishable from "not written yet"
                state.total_chunks = chunks.count_chunks().filter(|&n| n > 0);
            }
            state.raise_to(SPLIT_PROGRESS);
            state.progress_message = Some("split completed".to_string());
        }
        Signal::ChunkTranscribed(name) => {
            state.transcribed_chunk_names.insert(name);
            state.transcribed_chunks = state.transcribed_chunk_names.len();
            let candidate = state.transcribe_progress();
            state.raise_to(candidate);
            let total = state
                .total_chunks
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".to_string());
            state.progress_message = Some(format!(
                "transcribed {}/{} chunks",
                state.transcribed_chunks, total
            ));
        }
        Signal::EvaluationStarted => {
            state.raise_to(EVALUATION_PROGRESS);
            state.progress_message = Some("evaluating".to_string());
        }
    }
}
