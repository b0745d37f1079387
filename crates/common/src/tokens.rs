//! Token encoding
//!
//! Chunk windows and prompt budgets are measured with the same byte-pair
//! encoding the embedding model uses (cl100k_base), so token counts here are
//! exact for the provider.

use crate::errors::{AppError, Result};
use tiktoken_rs::CoreBPE;

/// Encoder/decoder used for chunking and token budgets
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode a token span back into text
    fn decode(&self, tokens: &[u32]) -> String;

    /// Count tokens in a text
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// cl100k_base tokenizer
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| AppError::Configuration {
            message: format!("Failed to load cl100k_base encoding: {}", e),
        })?;
        Ok(Self { bpe })
    }

    fn try_decode(&self, tokens: &[u32]) -> Option<String> {
        self.bpe
            .decode(tokens.iter().map(|&t| t as _).collect())
            .ok()
    }
}

/// Edge tokens that may be trimmed when a span splits a multi-byte character
const MAX_EDGE_TRIM: usize = 3;

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        if let Some(text) = self.try_decode(tokens) {
            return text;
        }

        // A window boundary can land inside a multi-byte character.
        for head in 0..=MAX_EDGE_TRIM.min(tokens.len()) {
            for tail in 0..=MAX_EDGE_TRIM.min(tokens.len() - head) {
                if head == 0 && tail == 0 {
                    continue;
                }
                if let Some(text) = self.try_decode(&tokens[head..tokens.len() - tail]) {
                    return text;
                }
            }
        }

        tracing::warn!(tokens = tokens.len(), "Token span could not be decoded");
        String::new()
    }
}

/// Whitespace tokenizer for tests: one token per word, spaces kept on the word.
#[derive(Default)]
pub struct WordTokenizer {
    vocab: std::sync::Mutex<Vec<String>>,
}

impl WordTokenizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut vocab = match self.vocab.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        text.split_inclusive(char::is_whitespace)
            .map(|piece| match vocab.iter().position(|v| v == piece) {
                Some(id) => id as u32,
                None => {
                    vocab.push(piece.to_string());
                    (vocab.len() - 1) as u32
                }
            })
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let vocab = match self.vocab.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens
            .iter()
            .filter_map(|&t| vocab.get(t as usize).map(String::as_str))
            .collect()
    }
}
