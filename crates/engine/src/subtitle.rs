//! Parsing of the constrained subtitle block format written by the
//! transcription stage, plus the timestamp forms used in captured output.
//!
//! A block is a run of non-blank lines:
//!
//! ```text
//! 1
//! 00:00:01,000 --> 00:00:02,500
//! Hello world
//! ```
//!
//! The index line is optional; `mm:ss.mmm` and `hh:mm:ss,mmm` are both accepted.

use once_cell::sync::Lazy;
use regex::Regex;

/// A cue with chunk-relative times in seconds
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Cue found in raw pipeline output, times still as written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCue {
    pub start: String,
    pub end: String,
    pub text: String,
}

static BRACKETED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[(\d{2}:\d{2}\.\d{3}|\d{2}:\d{2}:\d{2}\.\d{3})\s*-->\s*(\d{2}:\d{2}\.\d{3}|\d{2}:\d{2}:\d{2}\.\d{3})\]\s*([^\n\[]+)",
    )
    .expect("Invalid regex")
});

static INLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{2}:\d{2}\.\d{3})\s*-->\s*(\d{2}:\d{2}\.\d{3})\s*([^\n]+)").expect("Invalid regex")
});

/// Parse `mm:ss[.,]mmm` or `hh:mm:ss[.,]mmm` into seconds
pub fn parse_timestamp(ts: &str) -> Option<f64> {
    let parts: Vec<&str> = ts.trim().split(':').map(str::trim).collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [mm, ss] => (0, whole(mm)?, fraction(ss)?),
        [hh, mm, ss] => (whole(hh)?, whole(mm)?, fraction(ss)?),
        _ => return None,
    };
    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

fn whole(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn fraction(s: &str) -> Option<f64> {
    let normalized = s.replace(',', ".");
    if normalized.is_empty() || !normalized.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse every well-formed block of a subtitle file; malformed blocks are skipped
pub fn parse_blocks(content: &str) -> Vec<Cue> {
    split_blocks(content)
        .into_iter()
        .filter_map(|lines| parse_block(&lines))
        .collect()
}

fn split_blocks(content: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn parse_block(lines: &[&str]) -> Option<Cue> {
    let ts_index = lines.iter().position(|l| l.contains("-->"))?;
    let (raw_start, raw_end) = lines[ts_index].split_once("-->")?;

    // WebVTT may append cue settings after the end time
    let start = parse_timestamp(raw_start.split_whitespace().next()?)?;
    let end = parse_timestamp(raw_end.split_whitespace().next()?)?;

    let text = strip_trailing_number(&lines[ts_index + 1..].join(" "));
    Some(Cue { start, end, text })
}

/// Drop a trailing all-digit token, usually the next block's index line
fn strip_trailing_number(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.rsplit_once(char::is_whitespace) {
        Some((head, last)) if last.bytes().all(|b| b.is_ascii_digit()) => head.trim_end().to_string(),
        None if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) => String::new(),
        _ => trimmed.to_string(),
    }
}

/// Scan captured pipeline output for inline cues.
///
/// `[ts --> ts] text` is tried first; the bare `ts --> ts text` form only
/// when the bracketed form finds nothing.
pub fn scan_raw_output(output: &str) -> Vec<RawCue> {
    let collect = |re: &Regex| -> Vec<RawCue> {
        re.captures_iter(output)
            .map(|caps| RawCue {
                start: caps[1].to_string(),
                end: caps[2].to_string(),
                text: caps[3].trim().to_string(),
            })
            .collect()
    };

    let bracketed = collect(&BRACKETED_RE);
    if !bracketed.is_empty() {
        return bracketed;
    }
    collect(&INLINE_RE)
}

/// `hh:mm:ss`, sub-second part truncated, negatives clamp to zero
pub fn format_display(secs: f64) -> String {
    let total = if secs.is_finite() { secs.max(0.0).floor() as u64 } else { 0 };
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// `mm:ss.mmm`, or `hh:mm:ss.mmm` from one hour on
pub fn format_precise(secs: f64) -> String {
    let total_ms = if secs.is_finite() { (secs.max(0.0) * 1000.0).round() as u64 } else { 0 };
    let ms = total_ms % 1000;
    let total = total_ms / 1000;
    let (hh, mm, ss) = (total / 3600, (total % 3600) / 60, total % 60);
    if hh > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hh, mm, ss, ms)
    } else {
        format!("{:02}:{:02}.{:03}", mm, ss, ms)
    }
}
