//! Context configuration.

use serde::{Deserialize, Serialize};

use crate::backend::default_n_threads;

/// How per-token embeddings are reduced to one vector per sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    /// Keep per-token embeddings, addressed like logits.
    #[default]
    None,
    Mean,
    /// Embedding of the sequence's last token in the batch.
    Last,
}

/// Context parameters; every field has a default so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Cache cells; 0 means the model's training context.
    pub n_ctx: usize,
    /// Largest logical batch `decode` accepts.
    pub n_batch: usize,
    /// Physical micro-batch size, clamped to `n_batch`.
    pub n_ubatch: usize,
    pub n_seq_max: usize,
    /// Workers for single-token steps.
    pub n_threads: usize,
    /// Workers for multi-token steps.
    pub n_threads_batch: usize,
    /// Produce embeddings as well as logits.
    pub embeddings: bool,
    pub pooling: PoolingType,
    /// Request a defrag after decode when fragmentation exceeds this;
    /// negative disables.
    pub defrag_threshold: f32,
    pub no_perf: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        let n_threads = default_n_threads();
        Self {
            n_ctx: 512,
            n_batch: 2048,
            n_ubatch: 512,
            n_seq_max: 1,
            n_threads,
            n_threads_batch: n_threads,
            embeddings: false,
            pooling: PoolingType::None,
            defrag_threshold: -1.0,
            no_perf: false,
        }
    }
}
