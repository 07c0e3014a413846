//! Incremental phrase segmentation of a live generation stream.
//!
//! ## Algorithm (per fragment)
//!
//! ```text
//! 1. Append the fragment to the working buffer.
//! 2. Look for a stop marker in the not-yet-released part of the buffer.
//!    Found → cut the buffer at the marker, release everything before it,
//!    flush the remainder as the final phrase, ignore all later input.
//! 3. Otherwise hold back the longest buffer suffix that is still a prefix
//!    of some marker (the lookback window). Everything before it is
//!    confirmed marker-free and is released to the display stream.
//! 4. Split released text at break characters into phrases, trimming the
//!    whitespace that follows each break.
//! ```
//!
//! Held text is never shown or spoken until the next fragment proves it is
//! not the start of a marker, or the turn ends.

use serde::{Deserialize, Serialize};

/// Markers that end the assistant's turn when they show up in the text.
pub const DEFAULT_STOP_MARKERS: &[&str] = &["<|im_end|>", "<|im_start|>", "<|endoftext|>"];

/// Sentence terminators, clause punctuation and dash glyphs.
pub const DEFAULT_BREAK_CHARS: &[char] = &['.', '!', '?', ';', ':', '…', '—', '–'];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SegmenterConfig {
    pub stop_markers: Vec<String>,
    pub break_chars: Vec<char>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|m| m.to_string()).collect(),
            break_chars: DEFAULT_BREAK_CHARS.to_vec(),
        }
    }
}

/// A marker-free unit of text ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhraseChunk {
    /// Position in emission order, starting at 0 for each turn.
    pub index: usize,
    pub text: String,
    /// Emitted by the end-of-turn or stop-marker flush.
    pub is_final: bool,
}

impl PhraseChunk {
    /// Whether the chunk carries anything a voice could say.
    pub fn is_speakable(&self) -> bool {
        self.text.chars().any(char::is_alphanumeric)
    }
}

/// What one `push`/`finish` call released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentOutput {
    /// Newly confirmed text for the display stream, markers removed.
    pub display: String,
    /// Completed phrases, in order.
    pub chunks: Vec<PhraseChunk>,
}

impl SegmentOutput {
    pub fn is_empty(&self) -> bool {
        self.display.is_empty() && self.chunks.is_empty()
    }
}

pub struct TokenStreamSegmenter {
    markers: Vec<String>,
    break_chars: Vec<char>,
    /// Longest marker, in bytes.
    window: usize,
    buffer: String,
    /// Bytes at the front of `buffer` already released to the display stream.
    released: usize,
    next_index: usize,
    matched_marker: Option<String>,
    finished: bool,
}

impl TokenStreamSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        let markers: Vec<String> = config
            .stop_markers
            .into_iter()
            .filter(|m| !m.is_empty())
            .collect();
        let window = markers.iter().map(String::len).max().unwrap_or(0);
        Self {
            markers,
            break_chars: config.break_chars,
            window,
            buffer: String::new(),
            released: 0,
            next_index: 0,
            matched_marker: None,
            finished: false,
        }
    }

    /// Feed one generation fragment.
    ///
    /// After a stop marker has been seen every further fragment is discarded.
    pub fn push(&mut self, fragment: &str) -> SegmentOutput {
        let mut out = SegmentOutput::default();
        if self.matched_marker.is_some() || self.finished {
            return out;
        }
        self.buffer.push_str(fragment);

        if let Some((pos, marker)) = self.find_marker() {
            self.buffer.truncate(pos);
            self.matched_marker = Some(marker);
            self.release_all(&mut out);
            return out;
        }

        let safe_end = self.buffer.len() - self.held_suffix_len();
        self.release_display(safe_end, &mut out);
        self.split_phrases(safe_end, false, &mut out);
        out
    }

    /// End of turn: release whatever is still held as the final phrase.
    pub fn finish(&mut self) -> SegmentOutput {
        let mut out = SegmentOutput::default();
        if self.finished {
            return out;
        }
        self.finished = true;
        if self.matched_marker.is_none() {
            self.release_all(&mut out);
        }
        out
    }

    /// The marker that stopped the stream, if one was matched in text.
    pub fn matched_marker(&self) -> Option<&str> {
        self.matched_marker.as_deref()
    }

    pub fn stop_observed(&self) -> bool {
        self.matched_marker.is_some()
    }

    /// Phrases emitted so far.
    pub fn emitted(&self) -> usize {
        self.next_index
    }

    /// Bytes currently withheld from the display stream.
    pub fn held_len(&self) -> usize {
        self.buffer.len() - self.released
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn release_all(&mut self, out: &mut SegmentOutput) {
        let end = self.buffer.len();
        self.release_display(end, out);
        self.split_phrases(end, true, out);
        let rest = self.buffer.trim();
        if !rest.is_empty() {
            let text = rest.to_string();
            self.emit(text, true, out);
        }
        self.buffer.clear();
        self.released = 0;
    }

    fn release_display(&mut self, end: usize, out: &mut SegmentOutput) {
        if end > self.released {
            out.display.push_str(&self.buffer[self.released..end]);
            self.released = end;
        }
    }

    /// Earliest marker occurrence. Released text is known to be marker-free,
    /// so the search starts at the release point.
    fn find_marker(&self) -> Option<(usize, String)> {
        let start = self.released;
        self.markers
            .iter()
            .filter_map(|m| self.buffer[start..].find(m.as_str()).map(|p| (start + p, m)))
            .min_by_key(|(p, _)| *p)
            .map(|(p, m)| (p, m.clone()))
    }

    /// Length of the longest buffer suffix that could still grow into a marker.
    fn held_suffix_len(&self) -> usize {
        let tail = &self.buffer[self.released..];
        let earliest = tail.len().saturating_sub(self.window);
        for (i, _) in tail.char_indices() {
            if i < earliest {
                continue;
            }
            let suffix = &tail[i..];
            if self.markers.iter().any(|m| m.starts_with(suffix)) {
                return suffix.len();
            }
        }
        0
    }

    /// Cut phrases out of `buffer[..limit]`.
    ///
    /// A '.' between digits is a decimal point, not a break. A break run
    /// that ends at `limit` is not cut until the next character shows the
    /// run is over, unless `at_end` says nothing more is coming.
    fn split_phrases(&mut self, mut limit: usize, at_end: bool, out: &mut SegmentOutput) {
        loop {
            let Some(end) = self.next_break(limit, at_end) else {
                break;
            };
            let phrase = self.buffer[..end].trim().to_string();
            let after = &self.buffer[end..limit];
            let consumed = end + (after.len() - after.trim_start().len());

            self.buffer.drain(..consumed);
            self.released = self.released.saturating_sub(consumed);
            limit -= consumed;

            if !phrase.is_empty() {
                self.emit(phrase, false, out);
            }
        }
    }

    /// Byte offset just past the first complete break run in `buffer[..limit]`.
    fn next_break(&self, limit: usize, at_end: bool) -> Option<usize> {
        let region = &self.buffer[..limit];
        let mut prev: Option<char> = None;
        let mut iter = region.char_indices().peekable();
        while let Some((i, c)) = iter.next() {
            if self.break_chars.contains(&c) {
                let decimal_point = c == '.'
                    && prev.is_some_and(|p| p.is_ascii_digit())
                    && iter.peek().is_some_and(|&(_, n)| n.is_ascii_digit());
                if !decimal_point {
                    let mut end = i + c.len_utf8();
                    while let Some(&(j, n)) = iter.peek() {
                        if !self.break_chars.contains(&n) {
                            break;
                        }
                        end = j + n.len_utf8();
                        iter.next();
                    }
                    // A run touching the live edge may still grow.
                    if end == limit && !at_end {
                        return None;
                    }
                    return Some(end);
                }
            }
            prev = Some(c);
        }
        None
    }

    fn emit(&mut self, text: String, is_final: bool, out: &mut SegmentOutput) {
        out.chunks.push(PhraseChunk {
            index: self.next_index,
            text,
            is_final,
        });
        self.next_index += 1;
    }
}

impl Default for TokenStreamSegmenter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}
