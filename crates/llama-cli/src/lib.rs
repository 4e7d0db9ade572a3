//! Generation loop behind the `llama-cli` binary.
//!
//! tokenize → prefill → (sample → detokenize → decode)* on the reference
//! backend and byte vocabulary, with optional session reuse.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_engine::{Batch, LlamaError, Pos, TokenId};
use llama_models::ModelConfig;
use llama_runtime::{ComputeBackend, Context, ContextParams, TinyModel};
use llama_sampling::{SamplerChain, SamplingError, SamplingParams};
use llama_tokenizer::{ByteVocab, StreamingDetokenizer, TokenizerError, Vocab};

/// Error type for the generation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("prompt of {n_tokens} tokens does not fit a context of {n_ctx}")]
    PromptTooLong { n_tokens: usize, n_ctx: usize },

    #[error("sampling config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error(transparent)]
    Llama(#[from] LlamaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything one generation run needs.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub prompt: String,
    pub max_tokens: usize,
    pub sampling: SamplingParams,
    /// Cache cells; 0 uses the model's training context.
    pub n_ctx: usize,
    /// Worker count for both pools; `None` keeps the context default.
    pub n_threads: Option<usize>,
    /// Seed of the reference model weights.
    pub model_seed: u64,
    /// Session to restore before the prompt; a missing file starts fresh.
    pub load_session: Option<PathBuf>,
    /// Session written after generation.
    pub save_session: Option<PathBuf>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 16,
            sampling: SamplingParams::default(),
            n_ctx: 512,
            n_threads: None,
            model_seed: 42,
            load_session: None,
            save_session: None,
        }
    }
}

/// Result of a generation run.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Tokens held by the cache at the end (prompt + generated, minus any
    /// context-shift discards).
    pub history: Vec<TokenId>,
    /// Newly generated tokens.
    pub generated: Vec<TokenId>,
    /// Decoded output text (new tokens only).
    pub text: String,
    /// Prompt tokens reused from a loaded session.
    pub n_reused: usize,
}

/// Read a JSON sampling config; missing fields keep their defaults.
pub fn load_sampling_params(path: impl AsRef<Path>) -> Result<SamplingParams, GenerateError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| GenerateError::Config {
        path: path.to_path_buf(),
        source,
    })
}

/// The reference model the CLI runs against.
pub fn reference_model(seed: u64) -> Result<Arc<dyn ComputeBackend>, GenerateError> {
    let model = TinyModel::new(ModelConfig::tiny(ByteVocab::N_VOCAB), seed)?;
    Ok(Arc::new(model))
}

fn common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Decode `tokens` starting at `pos0` in chunks of at most `n_batch`,
/// requesting logits for the final token only.
fn decode_prompt(ctx: &mut Context, tokens: &[TokenId], pos0: Pos) -> Result<(), LlamaError> {
    let n_chunks = tokens.len().div_ceil(ctx.n_batch());
    let mut pos = pos0;
    for (i, chunk) in tokens.chunks(ctx.n_batch()).enumerate() {
        let mut batch = Batch::get_one(chunk, pos, 0)?;
        if i + 1 < n_chunks {
            batch.set_output(chunk.len() - 1, false)?;
        }
        ctx.decode(&batch)?;
        pos += chunk.len() as Pos;
    }
    Ok(())
}

/// Restore `path` into `ctx` and trim the cache to the prefix it shares with
/// `prompt`. Returns how many prompt tokens need no re-evaluation.
fn restore_session(
    ctx: &mut Context,
    path: &Path,
    prompt: &[TokenId],
) -> Result<usize, GenerateError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "session file not found, starting fresh");
        return Ok(0);
    }
    let n_ctx = ctx.n_ctx();
    let history = ctx.state_load_file(path, n_ctx)?;
    // at least one prompt token is always evaluated so fresh logits exist
    let n_reused = common_prefix(&history, prompt).min(prompt.len() - 1);
    ctx.kv_mut()
        .seq_remove(0, n_reused as Pos, -1)
        .map_err(LlamaError::from)?;
    tracing::info!(
        n_history = history.len(),
        n_reused,
        "reusing session prefix"
    );
    Ok(n_reused)
}

/// Drop the older half of the cache after `n_keep` and slide the rest down.
fn shift_context(
    ctx: &mut Context,
    history: &mut Vec<TokenId>,
    n_keep: usize,
) -> Result<(), LlamaError> {
    let n_past = history.len();
    let n_discard = (n_past - n_keep) / 2;
    let (keep, discard_end) = (n_keep as Pos, (n_keep + n_discard) as Pos);
    ctx.kv_mut().seq_remove(0, keep, discard_end)?;
    ctx.kv_mut().seq_add(0, discard_end, -1, -(n_discard as Pos));
    history.drain(n_keep..n_keep + n_discard);
    tracing::debug!(n_past, n_keep, n_discard, "context shift");
    Ok(())
}

/// Run the full generation pipeline, handing each completed piece of text
/// to `on_text` as it becomes available.
pub fn generate(
    opts: &GenerateOptions,
    mut on_text: impl FnMut(&str),
) -> Result<GenerateResult, GenerateError> {
    if opts.prompt.is_empty() {
        return Err(GenerateError::EmptyPrompt);
    }

    let vocab = ByteVocab::new();
    let mut params = ContextParams {
        n_ctx: opts.n_ctx,
        no_perf: opts.sampling.no_perf,
        ..Default::default()
    };
    if let Some(n) = opts.n_threads {
        params.n_threads = n;
        params.n_threads_batch = n;
    }
    let mut ctx = Context::new(reference_model(opts.model_seed)?, params)?;
    let n_ctx = ctx.n_ctx();

    let prompt = vocab.tokenize(&opts.prompt, true)?;
    if prompt.len() >= n_ctx {
        return Err(GenerateError::PromptTooLong {
            n_tokens: prompt.len(),
            n_ctx,
        });
    }

    let n_reused = match &opts.load_session {
        Some(path) => restore_session(&mut ctx, path, &prompt)?,
        None => 0,
    };
    decode_prompt(&mut ctx, &prompt[n_reused..], n_reused as Pos)?;
    let mut history = prompt.clone();

    let mut chain = SamplerChain::from_params(&opts.sampling, &vocab, n_ctx)?;
    tracing::debug!(seed = chain.get_seed(), stages = ?chain.names(), "sampler chain");

    let mut detok = StreamingDetokenizer::new();
    let mut generated = Vec::new();
    let mut text = String::new();
    let mut batch = Batch::new(1, 0, 1);

    while generated.len() < opts.max_tokens {
        let token = ctx.sample(&mut chain, -1)?;
        if vocab.is_eog(token) {
            tracing::debug!(n_generated = generated.len(), "end of generation");
            break;
        }
        generated.push(token);

        let piece = detok.push_token(&vocab, token)?;
        if !piece.is_empty() {
            on_text(&piece);
            text.push_str(&piece);
        }

        if history.len() >= n_ctx {
            // keep BOS
            shift_context(&mut ctx, &mut history, 1)?;
        }
        batch.clear();
        batch.add_token(token, history.len() as Pos, &[0], true)?;
        ctx.decode(&batch)?;
        history.push(token);
    }

    let tail = detok.flush();
    if !tail.is_empty() {
        on_text(&tail);
        text.push_str(&tail);
    }

    if let Some(path) = &opts.save_session {
        ctx.state_save_file(path, &history)?;
    }

    ctx.perf_print();
    chain.perf_print();

    Ok(GenerateResult {
        history,
        generated,
        text,
        n_reused,
    })
}
