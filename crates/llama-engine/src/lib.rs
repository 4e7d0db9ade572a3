//! # llama-engine
//!
//! The "narrow waist" of the llama.rs stack. Defines the identifiers, the error
//! taxonomy and the [`Batch`] unit of work that every other crate builds on.
//! The KV cache, samplers, tokenizer and runtime all speak these types, so a
//! backend can be swapped without touching callers.
//!
//! ## Design Notes
//!
//! ### Identifier Types
//! `TokenId`, `Pos` and `SeqId` are aliased as `i32` for FFI compatibility.
//! Negative values carry meaning at the API edges: a negative `SeqId` matches
//! any sequence and a negative position bound is an open range end.
//!
//! ### Error Propagation
//! Every crate keeps its own narrow error enum and converts into
//! [`LlamaError`] with `From`, so `?` composes from the cache up to the CLI.

mod batch;

pub use batch::{Batch, BatchSlot};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Position of a token inside its sequence.
pub type Pos = i32;

/// Logical sequence identifier inside a shared context.
pub type SeqId = i32;

/// Sentinel for "no token".
pub const TOKEN_NULL: TokenId = -1;

/// Top-level error type for all core operations.
///
/// Only [`LlamaError::SlotExhausted`] and [`LlamaError::CapacityExceeded`] are
/// safe to retry after the caller shrinks its request or grows the target.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("capacity exceeded: {requested} > {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("no KV cache slot for {n_tokens} tokens (cache holds {n_cells} cells); shrink the batch or grow the context")]
    SlotExhausted { n_tokens: usize, n_cells: usize },

    #[error("cache cannot remove part of sequence {seq_id}; remove the whole sequence instead")]
    PartialRemoveUnsupported { seq_id: SeqId },

    #[error("incompatible state: magic {magic:#010x}, version {version}")]
    IncompatibleVersion { magic: u32, version: u32 },

    #[error("compute error: {0}")]
    ComputeError(String),

    #[error("compute aborted by caller")]
    ComputeAborted,

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid output index {0}")]
    InvalidOutput(i32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed state: {0}")]
    MalformedState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlamaError {
    /// Whether the caller may retry after adjusting its request.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlamaError::SlotExhausted { .. } | LlamaError::CapacityExceeded { .. }
        )
    }

    /// Whether the failure leaves the in-flight call's cache state undefined.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LlamaError::ComputeError(_) | LlamaError::ComputeAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_errors() {
        assert!(LlamaError::SlotExhausted {
            n_tokens: 4,
            n_cells: 2
        }
        .is_retriable());
        assert!(LlamaError::CapacityExceeded {
            requested: 5,
            capacity: 4
        }
        .is_retriable());
        assert!(!LlamaError::ComputeAborted.is_retriable());
        assert!(!LlamaError::PartialRemoveUnsupported { seq_id: 0 }.is_retriable());
    }

    #[test]
    fn fatal_errors() {
        assert!(LlamaError::ComputeError("nan".into()).is_fatal());
        assert!(LlamaError::ComputeAborted.is_fatal());
        assert!(!LlamaError::IncompatibleVersion {
            magic: 0,
            version: 0
        }
        .is_fatal());
    }

    #[test]
    fn error_display_carries_context() {
        let err = LlamaError::IncompatibleVersion {
            magic: 0x6767736e,
            version: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x6767736e"));
        assert!(msg.contains("version 3"));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(LlamaError::Io(_))));
    }
}
