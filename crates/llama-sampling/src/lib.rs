//! # llama-sampling
//!
//! Composable, stateful sampling for llama.rs.
//!
//! A [`Sampler`] stage mutates a [`TokenDataArray`] in place; a
//! [`SamplerChain`] owns an ordered list of stages and ends in exactly one
//! selecting stage (greedy, dist or mirostat).
//!
//! Supports:
//! - Greedy (argmax, ties to the lowest id) and seeded distribution sampling
//! - Top-k, top-p, min-p, tail-free and locally-typical truncation
//! - Temperature, entropy-adaptive temperature
//! - Mirostat v1/v2
//! - Repetition/frequency/presence penalties and logit bias
//! - GBNF grammar constraints
//! - Deterministic seeded RNG for reproducible generation

mod chain;
mod grammar;
mod params;
mod samplers;

pub use chain::{PerfSamplerData, SamplerChain};
pub use grammar::{Grammar, GrammarSampler};
pub use params::{LogitBiasEntry, SamplingParams};
pub use samplers::{
    Dist, Greedy, LogitBias, MinP, Mirostat, MirostatV2, Penalties, Softmax, TailFree, Temp,
    TempExt, TopK, TopP, Typical,
};

use std::cmp::Ordering;
use std::fmt;

use llama_engine::{LlamaError, TokenId};

/// Seed value meaning "draw a random seed".
pub const DEFAULT_SEED: u32 = u32::MAX;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
    #[error("chain finished without selecting a token")]
    NoSelection,
    #[error("invalid sampler parameter: {0}")]
    InvalidParameter(String),
    #[error("grammar error: {0}")]
    Grammar(String),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

impl From<SamplingError> for LlamaError {
    fn from(err: SamplingError) -> Self {
        LlamaError::InvalidArgument(err.to_string())
    }
}

/// One candidate: token id, raw logit and derived probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate set passed through the stages of a chain.
///
/// `sorted` asserts descending order by logit as left by the last reordering
/// stage; truncating stages may invalidate any other ordering assumption.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDataArray {
    pub data: Vec<TokenData>,
    /// Index into `data` chosen by a selecting stage.
    pub selected: Option<usize>,
    pub sorted: bool,
}

/// Descending by logit, then ascending by id.
fn by_logit_desc(a: &TokenData, b: &TokenData) -> Ordering {
    b.logit
        .partial_cmp(&a.logit)
        .unwrap_or(Ordering::Equal)
        .then(a.id.cmp(&b.id))
}

impl TokenDataArray {
    /// One candidate per vocabulary entry; `id` is the index into `logits`.
    pub fn from_logits(logits: &[f32]) -> Self {
        Self {
            data: logits
                .iter()
                .enumerate()
                .map(|(i, &logit)| TokenData {
                    id: i as TokenId,
                    logit,
                    p: 0.0,
                })
                .collect(),
            selected: None,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data.sort_by(by_logit_desc);
            self.sorted = true;
        }
    }

    /// Recompute probabilities from logits without reordering.
    pub fn normalize(&mut self) {
        let max = self
            .data
            .iter()
            .map(|t| t.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            // nothing to normalize against; keep probabilities at zero
            for t in &mut self.data {
                t.p = 0.0;
            }
            return;
        }
        let mut sum = 0.0;
        for t in &mut self.data {
            t.p = (t.logit - max).exp();
            sum += t.p;
        }
        for t in &mut self.data {
            t.p /= sum;
        }
    }

    /// Sort descending, then normalize.
    pub fn softmax(&mut self) {
        self.sort_by_logit();
        self.normalize();
    }

    /// Keep the first `n` candidates.
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
        if self.selected.is_some_and(|s| s >= n) {
            self.selected = None;
        }
    }

    pub fn selected_token(&self) -> Option<TokenId> {
        self.selected.and_then(|i| self.data.get(i)).map(|t| t.id)
    }

    /// Find a candidate by id; O(1) when the array is still in vocabulary order.
    pub fn find_mut(&mut self, id: TokenId) -> Option<&mut TokenData> {
        let idx = usize::try_from(id).ok()?;
        if self.data.get(idx).is_some_and(|t| t.id == id) {
            return self.data.get_mut(idx);
        }
        self.data.iter_mut().find(|t| t.id == id)
    }
}

/// One stage of a sampling pipeline.
///
/// `accept` and `reset` default to no-ops for stateless stages. A stage is
/// released by dropping it.
pub trait Sampler: fmt::Debug + Send {
    fn name(&self) -> &str;

    /// Observe a token that was emitted.
    fn accept(&mut self, _token: TokenId) {}

    /// Reorder, truncate, rescale or select within `cur`.
    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()>;

    /// Restore the initial state (history, RNG, mirostat mu).
    fn reset(&mut self) {}

    /// Deep copy including private state.
    fn clone_box(&self) -> Box<dyn Sampler>;

    /// Seed of a seeded stage.
    fn seed(&self) -> Option<u32> {
        None
    }
}

impl Clone for Box<dyn Sampler> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_logits_keeps_vocab_order() {
        let cur = TokenDataArray::from_logits(&[0.5, 2.0, -1.0]);
        assert_eq!(cur.len(), 3);
        assert_eq!(cur.data[1].id, 1);
        assert!(!cur.sorted);
        assert_eq!(cur.selected_token(), None);
    }

    #[test]
    fn normalize_does_not_reorder() {
        let mut cur = TokenDataArray::from_logits(&[0.0, 1.0, 2.0]);
        cur.normalize();
        assert_eq!(cur.data[0].id, 0);
        let sum: f32 = cur.data.iter().map(|t| t.p).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(cur.data[2].p > cur.data[1].p);
    }

    #[test]
    fn softmax_sorts_with_id_tiebreak() {
        let mut cur = TokenDataArray::from_logits(&[1.0, 3.0, 3.0, 0.0]);
        cur.softmax();
        let ids: Vec<_> = cur.data.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 0, 3]);
        assert!(cur.sorted);
    }

    #[test]
    fn normalize_all_masked() {
        let mut cur = TokenDataArray::from_logits(&[f32::NEG_INFINITY; 3]);
        cur.normalize();
        assert!(cur.data.iter().all(|t| t.p == 0.0));
    }

    #[test]
    fn find_mut_after_reorder() {
        let mut cur = TokenDataArray::from_logits(&[1.0, 3.0, 2.0]);
        cur.softmax();
        cur.find_mut(2).unwrap().logit = 9.0;
        assert_eq!(cur.data.iter().find(|t| t.id == 2).unwrap().logit, 9.0);
        assert!(cur.find_mut(7).is_none());
        assert!(cur.find_mut(-1).is_none());
    }

    #[test]
    fn truncate_clears_out_of_range_selection() {
        let mut cur = TokenDataArray::from_logits(&[1.0, 2.0, 3.0]);
        cur.selected = Some(2);
        cur.truncate(2);
        assert_eq!(cur.selected, None);
    }
}
