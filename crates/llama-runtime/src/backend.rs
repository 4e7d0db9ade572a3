//! Compute backend seam.
//!
//! Provides:
//! - [`ComputeBackend`]: forward evaluation of one micro-batch against the KV cache
//! - [`ModelHparams`]: the shape a backend reports to the context
//! - [`ForwardStep`] / [`ForwardOutput`]: what goes in and comes out of a forward pass
//! - [`default_n_threads`]: worker count used when the caller does not pick one

use llama_engine::{LlamaError, Pos, Result, SeqId, TokenId};
use llama_kv::{KVCache, KVCapabilities, KeyShifter};

/// Polled between compute steps; returning `true` ends the call with
/// [`LlamaError::ComputeAborted`].
pub type AbortFn<'a> = dyn FnMut() -> bool + Send + 'a;

/// Shape of the model behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHparams {
    pub n_vocab: usize,
    /// Hidden size; also the width of embedding inputs and outputs.
    pub n_embd: usize,
    pub n_layer: usize,
    /// Width of one cached key row.
    pub n_embd_k: usize,
    /// Width of one cached value row.
    pub n_embd_v: usize,
    /// Context length the model was trained with.
    pub n_ctx_train: usize,
    pub has_encoder: bool,
    /// What the cache built for this model can do.
    pub capabilities: KVCapabilities,
}

/// Input rows of a micro-batch.
#[derive(Debug, Clone, Copy)]
pub enum StepInput<'a> {
    Tokens(&'a [TokenId]),
    /// `n_tokens * n_embd` values, row-major.
    Embeddings(&'a [f32]),
}

/// One physical micro-batch, already placed in the cache.
///
/// Cells `first_cell..first_cell + n_tokens` were claimed for these tokens and
/// carry their positions and sequence ids; the backend writes their K/V rows.
#[derive(Debug, Clone, Copy)]
pub struct ForwardStep<'a> {
    pub input: StepInput<'a>,
    pub positions: &'a [Pos],
    pub seq_ids: &'a [&'a [SeqId]],
    pub outputs: &'a [bool],
    pub first_cell: usize,
    /// Pooled encoder output for encoder/decoder models.
    pub cross: Option<&'a [f32]>,
}

impl ForwardStep<'_> {
    pub fn n_tokens(&self) -> usize {
        self.positions.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.iter().filter(|&&o| o).count()
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardOutput {
    /// `n_outputs * n_vocab`, rows in slot order of the output-flagged tokens.
    pub logits: Vec<f32>,
    /// `n_tokens * n_embd` final hidden states for every token.
    pub hidden: Vec<f32>,
}

/// Forward evaluation capability supplied by a model.
///
/// Backends are shared read-only between contexts; all mutable state lives in
/// the [`KVCache`] the context passes in. Parallelism is the backend's own
/// business and runs on whatever rayon pool the caller installed.
pub trait ComputeBackend: Send + Sync {
    fn hparams(&self) -> &ModelHparams;

    /// Evaluate `step`, writing K/V rows for its cells and returning logits
    /// for output-flagged tokens.
    fn forward(
        &self,
        step: &ForwardStep<'_>,
        kv: &mut KVCache,
        abort: &mut AbortFn<'_>,
    ) -> Result<ForwardOutput>;

    /// Run the encoder over `step` and return `n_tokens * n_embd` hidden rows.
    fn encode(&self, _step: &ForwardStep<'_>, _abort: &mut AbortFn<'_>) -> Result<Vec<f32>> {
        Err(LlamaError::ComputeError("model has no encoder".to_string()))
    }

    /// Re-encode a cached key row of layer `layer` after a shift of `delta`.
    fn shift_key(&self, layer: usize, k_row: &mut [f32], delta: Pos);
}

/// Adapts a backend to the cache's [`KeyShifter`] seam.
pub(crate) struct BackendShifter<'a>(pub &'a dyn ComputeBackend);

impl KeyShifter for BackendShifter<'_> {
    fn shift_key(&self, layer: usize, k_row: &mut [f32], delta: Pos) {
        self.0.shift_key(layer, k_row, delta);
    }
}

/// Logical processors minus two, clamped to `1..=8`.
pub fn default_n_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .saturating_sub(2)
        .clamp(1, 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threads_in_range() {
        let n = default_n_threads();
        assert!((1..=8).contains(&n));
    }

    #[test]
    fn step_counts() {
        let seqs: [&[SeqId]; 3] = [&[0], &[0], &[0]];
        let step = ForwardStep {
            input: StepInput::Tokens(&[1, 2, 3]),
            positions: &[0, 1, 2],
            seq_ids: &seqs,
            outputs: &[false, true, true],
            first_cell: 0,
            cross: None,
        };
        assert_eq!(step.n_tokens(), 3);
        assert_eq!(step.n_outputs(), 2);
    }
}
