//! # llama-runtime
//!
//! Decode engine for llama.rs. A [`Context`] owns one session's KV cache and
//! output buffers and drives a shared [`ComputeBackend`]:
//!
//! - [`Context::decode`] / [`Context::encode`]: micro-batched, transactional
//!   evaluation with abort polling and automatic defrag
//! - logits / embeddings addressed by batch slot or from the end
//! - session snapshots for the whole context or one sequence ([`state`])
//! - [`PerfContextData`] counters
//!
//! [`TinyModel`] is a seeded CPU reference backend that exercises the whole
//! path without model files.

pub mod backend;
mod context;
pub mod params;
pub mod perf;
pub mod reference;
pub mod state;

pub use backend::{
    default_n_threads, AbortFn, ComputeBackend, ForwardOutput, ForwardStep, ModelHparams, StepInput,
};
pub use context::Context;
pub use params::{ContextParams, PoolingType};
pub use perf::PerfContextData;
pub use reference::TinyModel;
pub use state::{SEQ_MAGIC, SEQ_VERSION, SESSION_MAGIC, SESSION_VERSION};
