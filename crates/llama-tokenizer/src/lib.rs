//! # llama-tokenizer
//!
//! Vocabulary collaborator and streaming detokenization for llama.rs.
//!
//! This crate provides:
//! - A `Vocab` trait: the only view the decode core has of the model's vocabulary
//! - A byte-level reference vocabulary for tests and the CLI
//! - A per-session streaming detokenizer that never splits a UTF-8 character

mod detokenizer;

pub use detokenizer::{is_valid_utf8, utf8_status, StreamingDetokenizer, Utf8Status};

use llama_engine::{LlamaError, TokenId, TOKEN_NULL};

/// Error type for vocabulary operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

impl From<TokenizerError> for LlamaError {
    fn from(err: TokenizerError) -> Self {
        LlamaError::InvalidArgument(err.to_string())
    }
}

/// Vocabulary as seen by the decode core. Segmentation itself is the
/// implementation's business.
pub trait Vocab: Send + Sync {
    fn n_vocab(&self) -> usize;

    /// Split `text` into token ids, optionally prefixed with BOS.
    fn tokenize(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>>;

    /// Raw bytes of one token; may be an incomplete UTF-8 fragment.
    fn token_to_piece(&self, token: TokenId) -> TokenizerResult<Vec<u8>>;

    /// End of generation (EOS, EOT, ...).
    fn is_eog(&self, token: TokenId) -> bool;

    fn bos(&self) -> TokenId;
    fn eos(&self) -> TokenId;

    fn pad(&self) -> TokenId {
        TOKEN_NULL
    }

    fn sep(&self) -> TokenId {
        TOKEN_NULL
    }

    /// Newline token, or `TOKEN_NULL` if the vocabulary has none.
    fn nl(&self) -> TokenId {
        TOKEN_NULL
    }

    /// First decoder token for encoder-decoder models.
    fn decoder_start_token(&self) -> TokenId {
        self.bos()
    }

    /// Concatenate pieces of `tokens`, replacing invalid UTF-8.
    fn detokenize(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut bytes = Vec::new();
        for &t in tokens {
            bytes.extend(self.token_to_piece(t)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Byte-level reference vocabulary.
///
/// - Ids `0..256` are raw bytes, so any text round-trips exactly
/// - BOS, EOS, PAD, SEP follow at `256..260` and render as empty pieces
/// - Deterministic and stateless
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteVocab;

impl ByteVocab {
    pub const BOS: TokenId = 256;
    pub const EOS: TokenId = 257;
    pub const PAD: TokenId = 258;
    pub const SEP: TokenId = 259;
    pub const N_VOCAB: usize = 260;

    pub fn new() -> Self {
        Self
    }
}

impl Vocab for ByteVocab {
    fn n_vocab(&self) -> usize {
        Self::N_VOCAB
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() + add_bos as usize);
        if add_bos {
            ids.push(Self::BOS);
        }
        ids.extend(text.bytes().map(TokenId::from));
        Ok(ids)
    }

    fn token_to_piece(&self, token: TokenId) -> TokenizerResult<Vec<u8>> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            Self::BOS | Self::EOS | Self::PAD | Self::SEP => Ok(Vec::new()),
            _ => Err(TokenizerError::InvalidToken(token)),
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == Self::EOS
    }

    fn bos(&self) -> TokenId {
        Self::BOS
    }

    fn eos(&self) -> TokenId {
        Self::EOS
    }

    fn pad(&self) -> TokenId {
        Self::PAD
    }

    fn sep(&self) -> TokenId {
        Self::SEP
    }

    fn nl(&self) -> TokenId {
        TokenId::from(b'\n')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_is_bytewise() {
        let vocab = ByteVocab::new();
        assert_eq!(vocab.tokenize("hi", false).unwrap(), vec![104, 105]);
        assert_eq!(
            vocab.tokenize("hi", true).unwrap(),
            vec![ByteVocab::BOS, 104, 105]
        );
    }

    #[test]
    fn tokenize_empty_string() {
        let vocab = ByteVocab::new();
        assert!(vocab.tokenize("", false).unwrap().is_empty());
    }

    #[test]
    fn multibyte_char_spans_tokens() {
        let vocab = ByteVocab::new();
        let ids = vocab.tokenize("é", false).unwrap();
        assert_eq!(ids, vec![0xC3, 0xA9]);
        assert_eq!(vocab.token_to_piece(ids[0]).unwrap(), vec![0xC3]);
    }

    #[test]
    fn detokenize_roundtrip() {
        let vocab = ByteVocab::new();
        let text = "hello, wörld 🦙";
        let ids = vocab.tokenize(text, true).unwrap();
        assert_eq!(vocab.detokenize(&ids).unwrap(), text);
    }

    #[test]
    fn special_tokens() {
        let vocab = ByteVocab::new();
        assert!(vocab.is_eog(ByteVocab::EOS));
        assert!(!vocab.is_eog(ByteVocab::BOS));
        assert_eq!(vocab.decoder_start_token(), ByteVocab::BOS);
        assert_eq!(vocab.nl(), 10);
        assert!(vocab.token_to_piece(ByteVocab::SEP).unwrap().is_empty());
    }

    #[test]
    fn invalid_token_errors() {
        let vocab = ByteVocab::new();
        assert_eq!(
            vocab.token_to_piece(999).unwrap_err(),
            TokenizerError::InvalidToken(999)
        );
        assert_eq!(
            vocab.token_to_piece(-1).unwrap_err(),
            TokenizerError::InvalidToken(-1)
        );
    }
}
