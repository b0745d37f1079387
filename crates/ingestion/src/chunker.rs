//! Token chunking module
//!
//! Splits document text into token-bounded, overlapping windows that prefer
//! to end on a sentence boundary, and recovers the line range each chunk
//! covers in the source text.

use docflow_common::config::ChunkingConfig;
use docflow_common::tokens::Tokenizer;
use std::sync::Arc;
use tracing::debug;

use crate::errors::IngestionError;

/// Share of a window's decoded text searched for a sentence boundary
const BOUNDARY_SEARCH_FRACTION: usize = 5;

/// Sentence-boundary markers, matched at their first byte
const BOUNDARY_MARKERS: &[&str] = &[".", "!", "?", "\n\n"];

/// One token window of a document
#[derive(Debug, Clone, PartialEq)]
pub struct TokenWindow {
    /// First token index, inclusive
    pub start: usize,
    /// Last token index, exclusive
    pub end: usize,
    /// Decoded window text, trimmed
    pub text: String,
}

/// Line range of a chunk inside its file, 1-based and inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub start_line: i32,
    pub end_line: i32,
}

/// Token-window chunker
#[derive(Clone)]
pub struct TokenChunker {
    tokenizer: Arc<dyn Tokenizer>,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl TokenChunker {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> Result<Self, IngestionError> {
        if max_tokens == 0 {
            return Err(IngestionError::Chunking("max_tokens must be positive".to_string()));
        }
        if overlap_tokens >= max_tokens {
            return Err(IngestionError::Chunking(format!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                overlap_tokens, max_tokens
            )));
        }

        Ok(Self {
            tokenizer,
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn from_config(
        tokenizer: Arc<dyn Tokenizer>,
        config: &ChunkingConfig,
    ) -> Result<Self, IngestionError> {
        Self::new(tokenizer, config.max_tokens, config.overlap_tokens)
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Lazily walk the token windows of `text`.
    ///
    /// The iterator is finite and can be restarted by cloning it before use.
    pub fn windows(&self, text: &str) -> ChunkWindows<'_> {
        ChunkWindows {
            chunker: self,
            tokens: self.tokenizer.encode(text),
            next_start: 0,
        }
    }

    /// Chunk texts in order; whitespace-only windows are dropped
    pub fn split(&self, text: &str) -> Vec<String> {
        let chunks: Vec<String> = self
            .windows(text)
            .map(|w| w.text)
            .filter(|t| !t.is_empty())
            .collect();

        debug!(
            input_len = text.len(),
            chunk_count = chunks.len(),
            max_tokens = self.max_tokens,
            "Text chunked"
        );

        chunks
    }
}

/// Iterator over the token windows of one document
#[derive(Clone)]
pub struct ChunkWindows<'a> {
    chunker: &'a TokenChunker,
    tokens: Vec<u32>,
    next_start: usize,
}

impl ChunkWindows<'_> {
    /// Total tokens in the document
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Pull a non-final window back to the last sentence boundary in its tail
    fn snap_end(&self, start: usize, window_end: usize, text: &str) -> usize {
        let Some(cut) = boundary_cut(text) else {
            return window_end;
        };
        let snapped = start + self.chunker.tokenizer.count(&text[..cut]);
        if snapped > start && snapped < window_end {
            snapped
        } else {
            window_end
        }
    }
}

impl Iterator for ChunkWindows<'_> {
    type Item = TokenWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.tokens.len();
        if self.next_start >= total {
            return None;
        }

        let start = self.next_start;
        let tokenizer = &self.chunker.tokenizer;
        let window_end = (start + self.chunker.max_tokens).min(total);

        let end = if window_end < total {
            let text = tokenizer.decode(&self.tokens[start..window_end]);
            self.snap_end(start, window_end, &text)
        } else {
            window_end
        };

        self.next_start = if end >= total {
            total
        } else {
            next_window_start(start, end, self.chunker.max_tokens, self.chunker.overlap_tokens)
        };

        let text = tokenizer.decode(&self.tokens[start..end]).trim().to_string();
        Some(TokenWindow { start, end, text })
    }
}

/// Start of the window after `start..end`: `max - overlap` tokens on, but
/// never past `end`, so no token is skipped when the end was snapped back.
fn next_window_start(start: usize, end: usize, max_tokens: usize, overlap_tokens: usize) -> usize {
    (start + max_tokens - overlap_tokens).min(end)
}

/// Byte offset just past the rightmost sentence boundary in the last fifth
/// of `text`
fn boundary_cut(text: &str) -> Option<usize> {
    let tail_len = text.len() / BOUNDARY_SEARCH_FRACTION;
    let tail_start = ceil_char_boundary(text, text.len() - tail_len);
    let tail = &text[tail_start..];

    BOUNDARY_MARKERS
        .iter()
        .filter_map(|marker| tail.rfind(marker))
        .max()
        .filter(|&pos| pos > 0)
        .map(|pos| tail_start + pos + 1)
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn line_at(content: &str, offset: usize) -> i32 {
    let newlines = content.as_bytes()[..offset.min(content.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count();
    newlines as i32 + 1
}

/// Recover the line range of each chunk in `content`.
///
/// Chunk `i` is searched for starting `lookback` bytes before the end of
/// chunk `i - 1`; when it cannot be found verbatim the previous end is used.
/// Offsets are approximate for content with repeated passages.
pub fn locate_chunks(content: &str, chunks: &[String], lookback: usize) -> Vec<LineSpan> {
    let mut spans = Vec::with_capacity(chunks.len());
    let mut prev_end = 0usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let search_from = if i == 0 {
            0
        } else {
            floor_char_boundary(content, prev_end.saturating_sub(lookback))
        };

        let start = content[search_from..]
            .find(chunk.as_str())
            .map(|pos| search_from + pos)
            .unwrap_or(prev_end);
        let end = (start + chunk.len()).min(content.len());

        let start_line = line_at(content, start);
        let end_line = line_at(content, end).max(start_line);
        spans.push(LineSpan {
            start_line,
            end_line,
        });

        prev_end = floor_char_boundary(content, end);
    }

    spans
}
