//! Text segmentation for parallel synthesis
//!
//! Splits request text into ordered, bounded [`Segment`]s that can be
//! synthesized independently and reassembled in order.
//!
//! # Rules
//!
//! - Input is normalized first (see [`normalize_text`]); an empty result is a
//!   [`SegmentationError::EmptyInput`].
//! - Sentences become segments. Sentences longer than `max_segment_len` are
//!   subdivided at clause boundaries, preferring punctuation near
//!   `clause_target_len`.
//! - The first segment may be cut early (at `first_segment_min_len`) to reduce
//!   time-to-first-audio.
//! - Every segment records its byte offset into the normalized text, so the
//!   original separators can always be recovered.
//!
//! # Example
//!
//! ```rust
//! use cadence_gateway::core::segmenter::{SegmenterConfig, TextSegmenter};
//!
//! let segmenter = TextSegmenter::new(SegmenterConfig {
//!     max_segment_len: 15,
//!     ..Default::default()
//! });
//! let result = segmenter.segment("Hello world. This is a test.").unwrap();
//! let texts: Vec<&str> = result.segments.iter().map(|s| s.text.as_str()).collect();
//! assert_eq!(texts, vec!["Hello world.", "This is a test."]);
//! ```

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Errors raised before any synthesis work starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentationError {
    #[error("Input text is empty after normalization")]
    EmptyInput,

    #[error("Invalid segmenter configuration: {0}")]
    InvalidConfig(String),
}

/// Processing state of a segment within one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// An independently synthesizable slice of the request text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position in the request, contiguous from 0
    pub index: usize,
    /// Segment text, never empty or whitespace-only
    pub text: String,
    /// Byte offset of `text` within the normalized input
    pub offset: usize,
    pub state: SegmentState,
}

impl Segment {
    /// Length in characters
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Byte offset one past the end of this segment in the normalized input
    pub fn end_offset(&self) -> usize {
        self.offset + self.text.len()
    }
}

/// Segmentation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Hard upper bound on segment length in characters
    pub max_segment_len: usize,
    /// Shortest allowed early cut for the first segment
    pub first_segment_min_len: usize,
    /// Whether the early first cut must land on punctuation
    pub first_segment_require_punct: bool,
    /// Shortest clause piece produced when subdividing a long sentence
    pub clause_min_len: usize,
    /// Preferred clause piece length when subdividing a long sentence
    pub clause_target_len: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_segment_len: 300,
            first_segment_min_len: 10,
            first_segment_require_punct: true,
            clause_min_len: 20,
            clause_target_len: 150,
        }
    }
}

/// Result of segmenting one request
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// The normalized input all offsets refer to
    pub normalized: String,
    pub segments: Vec<Segment>,
}

impl Segmentation {
    /// Rebuild the normalized text from the segments and the separators between them
    pub fn reassemble(&self) -> String {
        let mut out = String::with_capacity(self.normalized.len());
        let mut cursor = 0;
        for segment in &self.segments {
            out.push_str(&self.normalized[cursor..segment.offset]);
            out.push_str(&segment.text);
            cursor = segment.end_offset();
        }
        out.push_str(&self.normalized[cursor..]);
        out
    }

    /// Total number of characters across all segments
    pub fn total_chars(&self) -> usize {
        self.segments.iter().map(Segment::char_len).sum()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Clamped limits derived from a [`SegmenterConfig`]
#[derive(Debug, Clone, Copy)]
struct Limits {
    max: usize,
    first_min: usize,
    clause_min: usize,
    target: usize,
    margin: usize,
}

impl Limits {
    fn from_config(config: &SegmenterConfig) -> Result<Self, SegmentationError> {
        if config.max_segment_len == 0 {
            return Err(SegmentationError::InvalidConfig(
                "max_segment_len must be greater than zero".to_string(),
            ));
        }

        let max = config.max_segment_len;
        let clause_min = config.clause_min_len.min(max);
        let target = config.clause_target_len.clamp(clause_min.max(1), max);

        Ok(Self {
            max,
            first_min: config.first_segment_min_len.min(max),
            clause_min,
            target,
            margin: (target / 4).max(1),
        })
    }
}

/// Words that end in a period without ending a sentence
static ABBREVIATIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "e.g", "i.e", "approx", "dept",
        "fig", "mt",
    ]
    .into_iter()
    .collect()
});

fn is_sentence_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

fn is_cjk_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

fn is_clause_punct(c: char) -> bool {
    matches!(c, ',' | ';' | ':' | '—' | '–' | '，' | '、' | '；' | '：')
}

fn is_closing_mark(c: char) -> bool {
    matches!(c, '"' | '\'' | '”' | '’' | ')' | ']' | '»' | '」' | '』')
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Normalize input text
///
/// Trims the text, drops control characters, and collapses every whitespace
/// run into a single ASCII space.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c.is_control() {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }

    out
}

/// Byte index of the first non-space character at or after `pos`
fn skip_spaces(s: &str, pos: usize) -> usize {
    let trimmed = s[pos..].trim_start_matches(' ');
    s.len() - trimmed.len()
}

/// Whether the period at `pos` belongs to an abbreviation or an initial
fn is_abbreviation(s: &str, sentence_start: usize, pos: usize) -> bool {
    let word_start = s[sentence_start..pos]
        .rfind(' ')
        .map(|i| sentence_start + i + 1)
        .unwrap_or(sentence_start);
    let word = &s[word_start..pos];

    let mut chars = word.chars();
    if let (Some(first), None) = (chars.next(), chars.next()) {
        if first.is_uppercase() {
            return true;
        }
    }

    ABBREVIATIONS.contains(word.to_lowercase().as_str())
}

/// Byte spans of the sentences in `s`, separators excluded
fn sentence_spans(s: &str, base: usize) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = s.char_indices().collect();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if !is_sentence_terminator(c) {
            i += 1;
            continue;
        }

        // Absorb runs like "?!", "..." and trailing closing quotes
        let mut j = i + 1;
        while j < chars.len() && (is_sentence_terminator(chars[j].1) || is_closing_mark(chars[j].1))
        {
            j += 1;
        }

        let at_boundary = j == chars.len() || chars[j].1 == ' ';
        let abbreviated = c == '.' && j == i + 1 && is_abbreviation(s, start, pos);

        if (at_boundary || is_cjk_terminator(c)) && !abbreviated {
            let end = chars.get(j).map(|&(p, _)| p).unwrap_or(s.len());
            spans.push((base + start, base + end));

            let mut k = j;
            while k < chars.len() && chars[k].1 == ' ' {
                k += 1;
            }
            start = chars.get(k).map(|&(p, _)| p).unwrap_or(s.len());
            i = k;
        } else {
            i = j;
        }
    }

    if start < s.len() {
        spans.push((base + start, base + s.len()));
    }

    spans
}

/// Early cut for the first segment, as a byte end offset
fn first_cut(s: &str, limits: &Limits, require_punct: bool) -> Option<usize> {
    if char_count(s) <= limits.first_min {
        return None;
    }

    let mut iter = s.char_indices().peekable();
    let mut n = 0;
    let mut prev = None;

    while let Some((pos, c)) = iter.next() {
        n += 1;
        if n > limits.max {
            break;
        }

        let next = iter.peek().map(|&(_, ch)| ch);
        // A cut at the very end is no cut at all
        if next != Some(' ') || c == ' ' {
            prev = Some(c);
            continue;
        }

        if n >= limits.first_min {
            let punct = is_clause_punct(c)
                || is_sentence_terminator(c)
                || (is_closing_mark(c)
                    && prev.is_some_and(|p| is_clause_punct(p) || is_sentence_terminator(p)));
            if !require_punct || punct {
                return Some(pos + c.len_utf8());
            }
        }
        prev = Some(c);
    }

    None
}

/// Relative byte end of the first clause piece of an over-long `piece`
fn choose_cut(piece: &str, limits: &Limits) -> usize {
    let mut best_punct: Option<(usize, usize)> = None;
    let mut last_word_end: Option<usize> = None;
    let mut hard_cut = piece.len();
    let mut prev = None;
    let mut n = 0;
    let mut iter = piece.char_indices().peekable();

    while let Some((pos, c)) = iter.next() {
        n += 1;
        if n > limits.max {
            break;
        }
        let end = pos + c.len_utf8();
        hard_cut = end;

        let next = iter.peek().map(|&(_, ch)| ch);
        let word_end = c != ' ' && next == Some(' ');
        let prev_char = prev.replace(c);
        if !word_end || n < limits.clause_min {
            continue;
        }
        last_word_end = Some(end);

        let punct = is_clause_punct(c)
            || is_sentence_terminator(c)
            || (is_closing_mark(c)
                && prev_char.is_some_and(|p| is_clause_punct(p) || is_sentence_terminator(p)));
        if punct {
            let distance = n.abs_diff(limits.target);
            if best_punct.is_none_or(|(d, _)| distance < d) {
                best_punct = Some((distance, end));
            }
        }

        if n >= limits.target + limits.margin {
            if best_punct.is_none() {
                return end;
            }
            break;
        }
    }

    best_punct
        .map(|(_, end)| end)
        .or(last_word_end)
        .unwrap_or(hard_cut)
}

/// Subdivide the sentence `s[start..end]` into pieces of at most `limits.max` characters
fn split_clauses(s: &str, start: usize, end: usize, limits: &Limits) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let piece = &s[cursor..end];
        if char_count(piece) <= limits.max {
            pieces.push((cursor, end));
            break;
        }

        let cut = cursor + choose_cut(piece, limits);
        pieces.push((cursor, cut));
        cursor = skip_spaces(s, cut).min(end);
    }

    pieces
}

/// Fold sentences shorter than `clause_min` into their successor when it fits
fn merge_short(s: &str, spans: Vec<(usize, usize)>, limits: &Limits) -> Vec<(usize, usize)> {
    let mut merged = Vec::with_capacity(spans.len());
    let mut pending: Option<(usize, usize)> = None;

    for span in spans {
        let span = match pending.take() {
            Some(short) if char_count(&s[short.0..span.1]) <= limits.max => (short.0, span.1),
            Some(short) => {
                merged.push(short);
                span
            }
            None => span,
        };

        if char_count(&s[span.0..span.1]) < limits.clause_min {
            pending = Some(span);
        } else {
            merged.push(span);
        }
    }

    if let Some(short) = pending {
        merged.push(short);
    }

    merged
}

/// Splits text into ordered, bounded segments
#[derive(Debug, Clone, Default)]
pub struct TextSegmenter {
    config: SegmenterConfig,
}

impl TextSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segment `text`, returning the normalized input alongside the segments
    pub fn segment(&self, text: &str) -> Result<Segmentation, SegmentationError> {
        let limits = Limits::from_config(&self.config)?;
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(SegmentationError::EmptyInput);
        }

        let mut spans = Vec::new();
        let mut cursor = 0;

        if let Some(end) = first_cut(
            &normalized,
            &limits,
            self.config.first_segment_require_punct,
        ) {
            spans.push((0, end));
            cursor = skip_spaces(&normalized, end);
        }

        let mut bounded = Vec::new();
        for (start, end) in sentence_spans(&normalized[cursor..], cursor) {
            if char_count(&normalized[start..end]) <= limits.max {
                bounded.push((start, end));
            } else {
                bounded.extend(split_clauses(&normalized, start, end, &limits));
            }
        }
        spans.extend(merge_short(&normalized, bounded, &limits));

        let segments = spans
            .into_iter()
            .filter(|&(start, end)| end > start)
            .enumerate()
            .map(|(index, (start, end))| Segment {
                index,
                text: normalized[start..end].to_string(),
                offset: start,
                state: SegmentState::Pending,
            })
            .collect();

        Ok(Segmentation {
            normalized,
            segments,
        })
    }
}

/// Segment `text` with explicit limits
pub fn segment(
    text: &str,
    max_segment_len: usize,
    first_segment_min_len: usize,
    first_segment_require_punct: bool,
    clause_min_len: usize,
    clause_target_len: usize,
) -> Result<Vec<Segment>, SegmentationError> {
    let segmenter = TextSegmenter::new(SegmenterConfig {
        max_segment_len,
        first_segment_min_len,
        first_segment_require_punct,
        clause_min_len,
        clause_target_len,
    });
    Ok(segmenter.segment(text)?.segments)
}
