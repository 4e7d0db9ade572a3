//! Streaming detokenization with UTF-8 boundary handling.

use llama_engine::TokenId;

use crate::{TokenizerResult, Vocab};

/// Structural state of a byte buffer as UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Status {
    /// Every sequence is complete.
    Complete,
    /// Well-formed so far, but the last sequence is missing continuation bytes.
    Incomplete,
    /// A byte can never start or continue a sequence.
    Invalid,
}

fn sequence_len(lead: u8) -> Option<usize> {
    if lead & 0x80 == 0x00 {
        Some(1)
    } else if lead & 0xE0 == 0xC0 {
        Some(2)
    } else if lead & 0xF0 == 0xE0 {
        Some(3)
    } else if lead & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

/// Classify `bytes` by lead-byte length and continuation tags.
pub fn utf8_status(bytes: &[u8]) -> Utf8Status {
    let mut i = 0;
    while i < bytes.len() {
        let Some(len) = sequence_len(bytes[i]) else {
            return Utf8Status::Invalid;
        };
        let end = (i + len).min(bytes.len());
        if bytes[i + 1..end].iter().any(|&b| b & 0xC0 != 0x80) {
            return Utf8Status::Invalid;
        }
        if i + len > bytes.len() {
            return Utf8Status::Incomplete;
        }
        i += len;
    }
    Utf8Status::Complete
}

pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    utf8_status(bytes) == Utf8Status::Complete
}

/// Per-session accumulation buffer.
///
/// Pieces are appended as they arrive; the buffer is released only once it
/// holds whole characters, so a character split across two tokens surfaces on
/// the second one. Each generation session owns its own instance.
#[derive(Debug, Clone, Default)]
pub struct StreamingDetokenizer {
    buffer: Vec<u8>,
}

impl StreamingDetokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `piece` and return whatever text is now complete (possibly empty).
    ///
    /// Bytes that can never become valid are released lossily so the stream
    /// doesn't stall.
    pub fn push(&mut self, piece: &[u8]) -> String {
        self.buffer.extend_from_slice(piece);
        match utf8_status(&self.buffer) {
            Utf8Status::Complete => {
                let text = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                text
            }
            Utf8Status::Incomplete => String::new(),
            Utf8Status::Invalid => {
                tracing::debug!(bytes = self.buffer.len(), "releasing malformed UTF-8");
                self.flush()
            }
        }
    }

    /// Look up `token`'s piece in `vocab` and push it.
    pub fn push_token(&mut self, vocab: &dyn Vocab, token: TokenId) -> TokenizerResult<String> {
        let piece = vocab.token_to_piece(token)?;
        Ok(self.push(&piece))
    }

    /// Bytes withheld so far.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Release the buffer as-is, replacing an incomplete tail. Use at end of generation.
    pub fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        text
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
