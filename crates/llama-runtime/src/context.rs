//! Inference context: owns the KV cache and output buffers of one generation
//! session and drives a shared backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use llama_engine::{Batch, LlamaError, Result, SeqId, TokenId};
use llama_kv::{KVCache, KVCacheConfig};
use llama_sampling::SamplerChain;
use rayon::{ThreadPool, ThreadPoolBuilder};
use uuid::Uuid;

use crate::backend::{AbortFn, BackendShifter, ComputeBackend, ForwardStep, ModelHparams, StepInput};
use crate::params::{ContextParams, PoolingType};
use crate::perf::{PerfContextData, PerfCounters};

type AbortCallback = Box<dyn FnMut() -> bool + Send>;

/// Logits and embeddings of the last decode.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Outputs {
    /// Batch slot → output row, `-1` when the slot produced no output.
    pub(crate) ids: Vec<i32>,
    pub(crate) n_outputs: usize,
    /// `n_outputs * n_vocab`.
    pub(crate) logits: Vec<f32>,
    /// `n_outputs * n_embd` when embeddings are on and pooling is none.
    pub(crate) embd: Vec<f32>,
}

fn build_pool(n_threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build()
        .map_err(|e| LlamaError::ComputeError(format!("thread pool: {e}")))
}

/// One generation session against a shared model.
///
/// Calls are synchronous; the caller serializes access. Several contexts may
/// share one backend across threads.
pub struct Context {
    id: Uuid,
    model: Arc<dyn ComputeBackend>,
    params: ContextParams,
    pub(crate) kv: KVCache,
    pool: ThreadPool,
    pool_batch: ThreadPool,
    abort: Option<AbortCallback>,
    pub(crate) outputs: Outputs,
    embd_seq: BTreeMap<SeqId, Vec<f32>>,
    /// Pooled encoder output consumed by later decodes.
    cross: Option<Vec<f32>>,
    perf: PerfCounters,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("used_cells", &self.kv.used_cells())
            .field("n_outputs", &self.outputs.n_outputs)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a context with its own cache.
    ///
    /// `n_ctx == 0` resolves to the model's training context; `n_ubatch` is
    /// clamped to `n_batch`.
    ///
    /// # Errors
    /// - `InvalidArgument`: Zero batch size, sequence count or thread count
    pub fn new(model: Arc<dyn ComputeBackend>, params: ContextParams) -> Result<Self> {
        let mut perf = PerfCounters::new(!params.no_perf);
        let hp = *model.hparams();

        let mut params = params;
        if params.n_ctx == 0 {
            params.n_ctx = hp.n_ctx_train;
        }
        params.n_ubatch = params.n_ubatch.min(params.n_batch);
        for (name, value) in [
            ("n_ctx", params.n_ctx),
            ("n_batch", params.n_batch),
            ("n_ubatch", params.n_ubatch),
            ("n_seq_max", params.n_seq_max),
            ("n_threads", params.n_threads),
            ("n_threads_batch", params.n_threads_batch),
        ] {
            if value == 0 {
                return Err(LlamaError::InvalidArgument(format!("{name} must be > 0")));
            }
        }
        if params.n_ctx > hp.n_ctx_train {
            tracing::warn!(
                n_ctx = params.n_ctx,
                n_ctx_train = hp.n_ctx_train,
                "context is larger than the training context"
            );
        }

        let kv = KVCache::new(KVCacheConfig {
            n_cells: params.n_ctx,
            n_layer: hp.n_layer,
            n_embd_k: hp.n_embd_k,
            n_embd_v: hp.n_embd_v,
            n_seq_max: params.n_seq_max,
            capabilities: hp.capabilities,
        });

        let id = Uuid::new_v4();
        let ctx = Self {
            id,
            pool: build_pool(params.n_threads)?,
            pool_batch: build_pool(params.n_threads_batch)?,
            kv,
            model,
            abort: None,
            outputs: Outputs::default(),
            embd_seq: BTreeMap::new(),
            cross: None,
            perf: {
                perf.mark_loaded();
                perf
            },
            params,
        };

        tracing::info!(
            ctx = %id,
            n_ctx = ctx.params.n_ctx,
            n_batch = ctx.params.n_batch,
            n_ubatch = ctx.params.n_ubatch,
            n_seq_max = ctx.params.n_seq_max,
            n_threads = ctx.params.n_threads,
            kv_bytes = ctx.kv.memory_bytes(),
            "created context"
        );
        Ok(ctx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn hparams(&self) -> &ModelHparams {
        self.model.hparams()
    }

    pub fn n_ctx(&self) -> usize {
        self.params.n_ctx
    }

    pub fn n_batch(&self) -> usize {
        self.params.n_batch
    }

    pub fn n_ubatch(&self) -> usize {
        self.params.n_ubatch
    }

    pub fn n_seq_max(&self) -> usize {
        self.params.n_seq_max
    }

    pub fn n_vocab(&self) -> usize {
        self.model.hparams().n_vocab
    }

    pub fn n_embd(&self) -> usize {
        self.model.hparams().n_embd
    }

    pub fn model_has_encoder(&self) -> bool {
        self.model.hparams().has_encoder
    }

    pub fn kv(&self) -> &KVCache {
        &self.kv
    }

    /// Direct access for sequence operations (`seq_remove`, `seq_add`, ...).
    pub fn kv_mut(&mut self) -> &mut KVCache {
        &mut self.kv
    }

    /// Apply pending cache shifts and defragmentation now.
    pub fn kv_update(&mut self) -> Result<bool> {
        Ok(self.kv.update(&BackendShifter(self.model.as_ref()))?)
    }

    /// Install a predicate polled between compute steps.
    pub fn set_abort_callback<F>(&mut self, callback: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.abort = Some(Box::new(callback));
    }

    pub fn clear_abort_callback(&mut self) {
        self.abort = None;
    }

    /// Resize the worker pools for single-token and multi-token steps.
    pub fn set_n_threads(&mut self, n_threads: usize, n_threads_batch: usize) -> Result<()> {
        if n_threads == 0 || n_threads_batch == 0 {
            return Err(LlamaError::InvalidArgument("thread count must be > 0".to_string()));
        }
        self.pool = build_pool(n_threads)?;
        self.pool_batch = build_pool(n_threads_batch)?;
        self.params.n_threads = n_threads;
        self.params.n_threads_batch = n_threads_batch;
        tracing::debug!(ctx = %self.id, n_threads, n_threads_batch, "resized thread pools");
        Ok(())
    }

    pub fn n_threads(&self) -> usize {
        self.params.n_threads
    }

    pub fn n_threads_batch(&self) -> usize {
        self.params.n_threads_batch
    }

    pub fn set_embeddings(&mut self, embeddings: bool) {
        self.params.embeddings = embeddings;
    }

    fn validate(&self, batch: &Batch) -> Result<()> {
        let hp = self.model.hparams();
        if batch.is_empty() {
            return Err(LlamaError::InvalidBatch("batch is empty".to_string()));
        }
        if batch.n_tokens() > self.params.n_batch {
            return Err(LlamaError::InvalidBatch(format!(
                "{} tokens exceed n_batch {}",
                batch.n_tokens(),
                self.params.n_batch
            )));
        }
        if batch.is_embeddings() && batch.n_embd() != hp.n_embd {
            return Err(LlamaError::InvalidBatch(format!(
                "embedding width {} does not match model width {}",
                batch.n_embd(),
                hp.n_embd
            )));
        }
        for (i, slot) in batch.iter().enumerate() {
            if let Some(token) = slot.token {
                if token < 0 || token as usize >= hp.n_vocab {
                    return Err(LlamaError::InvalidBatch(format!(
                        "slot {i}: token {token} outside vocabulary of {}",
                        hp.n_vocab
                    )));
                }
            }
            if slot.pos < 0 {
                return Err(LlamaError::InvalidBatch(format!(
                    "slot {i}: negative position {}",
                    slot.pos
                )));
            }
            if slot.seq_ids.is_empty() {
                return Err(LlamaError::InvalidBatch(format!("slot {i}: no sequence id")));
            }
            if let Some(&s) = slot
                .seq_ids
                .iter()
                .find(|&&s| s < 0 || s as usize >= self.params.n_seq_max)
            {
                return Err(LlamaError::InvalidBatch(format!(
                    "slot {i}: sequence id {s} outside 0..{}",
                    self.params.n_seq_max
                )));
            }
        }
        Ok(())
    }

    /// Evaluate `batch` against the cache.
    ///
    /// The batch is split into micro-batches of `n_ubatch` tokens. Logits for
    /// output-flagged slots are afterwards available through
    /// [`Context::logits_ith`]. On any error the cache metadata is restored to
    /// its state before the call and the previous outputs are dropped.
    ///
    /// # Errors
    /// - `InvalidBatch`: Bad token, position or sequence id
    /// - `SlotExhausted`: No room in the cache; shrink the batch or grow the context
    /// - `ComputeError` / `ComputeAborted`: Backend failure or abort callback
    pub fn decode(&mut self, batch: &Batch) -> Result<()> {
        self.validate(batch)?;
        let start = Instant::now();

        if self.kv.has_pending() {
            self.kv_update()?;
        }

        let checkpoint = self.kv.checkpoint();
        match self.decode_ubatches(batch) {
            Ok(outputs) => {
                self.outputs = outputs;
            }
            Err(err) => {
                self.kv.rollback(checkpoint);
                self.outputs = Outputs::default();
                match &err {
                    LlamaError::SlotExhausted { .. } => {
                        tracing::warn!(ctx = %self.id, n_tokens = batch.n_tokens(), "{err}")
                    }
                    _ => tracing::debug!(ctx = %self.id, "decode failed: {err}"),
                }
                return Err(err);
            }
        }

        self.perf.record(batch.n_tokens(), start.elapsed());

        if self.params.defrag_threshold >= 0.0 {
            let frag = self.kv.fragmentation();
            if frag > self.params.defrag_threshold {
                tracing::debug!(ctx = %self.id, fragmentation = frag, "requesting defrag");
                self.kv.defrag();
            }
        }
        Ok(())
    }

    fn decode_ubatches(&mut self, batch: &Batch) -> Result<Outputs> {
        let hp = *self.model.hparams();
        let n_tokens = batch.n_tokens();
        let want_embd = self.params.embeddings;
        let pooled = want_embd && self.params.pooling != PoolingType::None;

        let mut out = Outputs {
            ids: vec![-1; n_tokens],
            n_outputs: 0,
            logits: Vec::with_capacity(batch.n_outputs() * hp.n_vocab),
            embd: Vec::new(),
        };
        let mut hidden_all: Vec<f32> = Vec::new();
        self.embd_seq.clear();

        let mut never = || false;
        let abort: &mut AbortFn<'_> = match self.abort.as_mut() {
            Some(cb) => cb.as_mut(),
            None => &mut never,
        };

        let mut start = 0;
        while start < n_tokens {
            let end = (start + self.params.n_ubatch).min(n_tokens);
            let positions = &batch.positions()[start..end];
            let outputs = &batch.outputs()[start..end];
            let seq_ids: Vec<&[SeqId]> = (start..end).map(|i| batch.seq_ids(i)).collect();

            let entries: Vec<_> = positions.iter().copied().zip(seq_ids.iter().copied()).collect();
            let first_cell = self.kv.find_slot(&entries)?;

            let embd_rows: Vec<f32>;
            let input = if batch.is_embeddings() {
                embd_rows = (start..end)
                    .filter_map(|i| batch.embd(i))
                    .flatten()
                    .copied()
                    .collect();
                StepInput::Embeddings(&embd_rows)
            } else {
                StepInput::Tokens(&batch.tokens()[start..end])
            };

            let step = ForwardStep {
                input,
                positions,
                seq_ids: &seq_ids,
                outputs,
                first_cell,
                cross: self.cross.as_deref(),
            };

            let pool = if end - start > 1 { &self.pool_batch } else { &self.pool };
            let model = self.model.as_ref();
            let kv = &mut self.kv;
            let result = pool.install(|| model.forward(&step, kv, &mut *abort))?;

            if result.logits.len() != step.n_outputs() * hp.n_vocab
                || result.hidden.len() != step.n_tokens() * hp.n_embd
            {
                return Err(LlamaError::ComputeError(format!(
                    "backend returned {} logits and {} hidden values for {} tokens",
                    result.logits.len(),
                    result.hidden.len(),
                    step.n_tokens()
                )));
            }

            for (j, &want) in outputs.iter().enumerate() {
                if want {
                    out.ids[start + j] = out.n_outputs as i32;
                    out.n_outputs += 1;
                    if want_embd && !pooled {
                        out.embd
                            .extend_from_slice(&result.hidden[j * hp.n_embd..(j + 1) * hp.n_embd]);
                    }
                }
            }
            out.logits.extend(result.logits);
            if pooled {
                hidden_all.extend(result.hidden);
            }
            start = end;
        }

        if pooled {
            self.pool_embeddings(batch, &hidden_all, 0, hp.n_embd);
        }
        Ok(out)
    }

    /// Reduce per-token hidden rows (`hidden` starts at slot `offset`) into
    /// per-sequence embeddings.
    fn pool_embeddings(&mut self, batch: &Batch, hidden: &[f32], offset: usize, n_embd: usize) {
        let mut sums: BTreeMap<SeqId, (Vec<f32>, usize)> = BTreeMap::new();
        for (j, row) in hidden.chunks_exact(n_embd).enumerate() {
            for &s in batch.seq_ids(offset + j) {
                let entry = sums.entry(s).or_insert_with(|| (vec![0.0; n_embd], 0));
                match self.params.pooling {
                    PoolingType::Mean => {
                        for (a, b) in entry.0.iter_mut().zip(row) {
                            *a += b;
                        }
                    }
                    _ => entry.0.copy_from_slice(row),
                }
                entry.1 += 1;
            }
        }
        for (s, (mut v, n)) in sums {
            if self.params.pooling == PoolingType::Mean {
                v.iter_mut().for_each(|x| *x /= n as f32);
            }
            self.embd_seq.insert(s, v);
        }
    }

    /// Run the encoder over `batch` and keep its output for later decodes.
    ///
    /// The whole batch must fit one micro-batch.
    ///
    /// # Errors
    /// - `InvalidArgument`: The model has no encoder
    /// - `InvalidBatch`: Validation failure or more than `n_ubatch` tokens
    pub fn encode(&mut self, batch: &Batch) -> Result<()> {
        if !self.model_has_encoder() {
            return Err(LlamaError::InvalidArgument("model has no encoder".to_string()));
        }
        self.validate(batch)?;
        if batch.n_tokens() > self.params.n_ubatch {
            return Err(LlamaError::InvalidBatch(format!(
                "encoder batch of {} tokens exceeds n_ubatch {}",
                batch.n_tokens(),
                self.params.n_ubatch
            )));
        }
        let start = Instant::now();
        let n_embd = self.n_embd();

        let seq_ids: Vec<&[SeqId]> = (0..batch.n_tokens()).map(|i| batch.seq_ids(i)).collect();
        let embd_rows: Vec<f32>;
        let input = if batch.is_embeddings() {
            embd_rows = (0..batch.n_tokens())
                .filter_map(|i| batch.embd(i))
                .flatten()
                .copied()
                .collect();
            StepInput::Embeddings(&embd_rows)
        } else {
            StepInput::Tokens(batch.tokens())
        };
        let step = ForwardStep {
            input,
            positions: batch.positions(),
            seq_ids: &seq_ids,
            outputs: batch.outputs(),
            first_cell: 0,
            cross: None,
        };

        let mut never = || false;
        let abort: &mut AbortFn<'_> = match self.abort.as_mut() {
            Some(cb) => cb.as_mut(),
            None => &mut never,
        };
        let model = self.model.as_ref();
        let hidden = self.pool_batch.install(|| model.encode(&step, &mut *abort))?;
        if hidden.len() != batch.n_tokens() * n_embd {
            return Err(LlamaError::ComputeError(format!(
                "encoder returned {} values for {} tokens",
                hidden.len(),
                batch.n_tokens()
            )));
        }

        let mut mean = vec![0.0; n_embd];
        for row in hidden.chunks_exact(n_embd) {
            for (a, b) in mean.iter_mut().zip(row) {
                *a += b;
            }
        }
        mean.iter_mut().for_each(|x| *x /= batch.n_tokens() as f32);
        self.cross = Some(mean);

        let mut out = Outputs {
            ids: vec![-1; batch.n_tokens()],
            ..Outputs::default()
        };
        if self.params.embeddings {
            if self.params.pooling == PoolingType::None {
                for (j, &want) in batch.outputs().iter().enumerate() {
                    if want {
                        out.ids[j] = out.n_outputs as i32;
                        out.n_outputs += 1;
                        out.embd.extend_from_slice(&hidden[j * n_embd..(j + 1) * n_embd]);
                    }
                }
            } else {
                self.pool_embeddings(batch, &hidden, 0, n_embd);
            }
        }
        self.outputs = out;
        self.perf.record(batch.n_tokens(), start.elapsed());
        tracing::debug!(ctx = %self.id, n_tokens = batch.n_tokens(), "encoded batch");
        Ok(())
    }

    fn output_row(&self, i: i32) -> Result<usize> {
        let row = if i >= 0 {
            self.outputs
                .ids
                .get(i as usize)
                .copied()
                .filter(|&r| r >= 0)
                .map(|r| r as usize)
        } else {
            let back = i.unsigned_abs() as usize;
            self.outputs.n_outputs.checked_sub(back)
        };
        row.ok_or(LlamaError::InvalidOutput(i))
    }

    /// Every output row of the last decode, `n_outputs * n_vocab`.
    pub fn logits(&self) -> &[f32] {
        &self.outputs.logits
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.n_outputs
    }

    /// Logits of batch slot `i`, or of output row `n_outputs + i` when `i < 0`.
    ///
    /// # Errors
    /// - `InvalidOutput`: The slot produced no output or `i` is out of range
    pub fn logits_ith(&self, i: i32) -> Result<&[f32]> {
        let row = self.output_row(i)?;
        let n_vocab = self.n_vocab();
        self.outputs
            .logits
            .get(row * n_vocab..(row + 1) * n_vocab)
            .ok_or(LlamaError::InvalidOutput(i))
    }

    /// Per-token embedding, addressed like [`Context::logits_ith`].
    ///
    /// Only populated when embeddings are enabled with pooling `none`.
    pub fn embeddings_ith(&self, i: i32) -> Result<&[f32]> {
        let row = self.output_row(i)?;
        let n_embd = self.n_embd();
        self.outputs
            .embd
            .get(row * n_embd..(row + 1) * n_embd)
            .ok_or(LlamaError::InvalidOutput(i))
    }

    /// Pooled embedding of `seq_id`.
    pub fn embeddings_seq(&self, seq_id: SeqId) -> Option<&[f32]> {
        self.embd_seq.get(&seq_id).map(Vec::as_slice)
    }

    /// Sample from the logits of output `idx` and accept the token into `chain`.
    pub fn sample(&self, chain: &mut SamplerChain, idx: i32) -> Result<TokenId> {
        let logits = self.logits_ith(idx)?;
        Ok(chain.sample(logits)?)
    }

    pub fn perf(&self) -> PerfContextData {
        self.perf.snapshot()
    }

    pub fn perf_reset(&mut self) {
        self.perf.reset();
    }

    pub fn perf_print(&self) {
        let p = self.perf();
        tracing::info!(
            ctx = %self.id,
            t_load_ms = p.t_load_ms,
            t_p_eval_ms = p.t_p_eval_ms,
            n_p_eval = p.n_p_eval,
            prompt_tok_per_s = p.prompt_tokens_per_sec(),
            t_eval_ms = p.t_eval_ms,
            n_eval = p.n_eval,
            tok_per_s = p.tokens_per_sec(),
            "context timings"
        );
    }

    /// Drop every cache cell, outputs and pooled embeddings.
    pub fn reset(&mut self) {
        self.kv.clear();
        self.outputs = Outputs::default();
        self.clear_derived();
    }

    /// Forget pooled embeddings and encoder output, which snapshots do not carry.
    pub(crate) fn clear_derived(&mut self) {
        self.embd_seq.clear();
        self.cross = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TinyModel;
    use llama_models::ModelConfig;

    fn context(params: ContextParams) -> Context {
        let model = TinyModel::new(ModelConfig::tiny(32), 3).unwrap();
        Context::new(Arc::new(model), params).unwrap()
    }

    fn small() -> ContextParams {
        ContextParams {
            n_ctx: 16,
            n_batch: 16,
            n_ubatch: 4,
            n_threads: 1,
            n_threads_batch: 2,
            ..Default::default()
        }
    }

    #[test]
    fn n_ctx_zero_uses_training_context() {
        let ctx = context(ContextParams {
            n_ctx: 0,
            n_ubatch: 4096,
            n_batch: 8,
            ..small()
        });
        assert_eq!(ctx.n_ctx(), 4096);
        assert_eq!(ctx.n_ubatch(), 8);
    }

    #[test]
    fn zero_seq_max_rejected() {
        let model = TinyModel::new(ModelConfig::tiny(32), 3).unwrap();
        let err = Context::new(Arc::new(model), ContextParams { n_seq_max: 0, ..small() })
            .unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
    }

    #[test]
    fn output_addressing() {
        let mut ctx = context(small());
        let mut batch = Batch::new(8, 0, 1);
        for (i, t) in [1, 2, 3, 4, 5, 6].into_iter().enumerate() {
            batch.add_token(t, i as i32, &[0], i == 1 || i == 5).unwrap();
        }
        ctx.decode(&batch).unwrap();

        assert_eq!(ctx.n_outputs(), 2);
        assert_eq!(ctx.logits().len(), 2 * 32);
        assert_eq!(ctx.logits_ith(5).unwrap(), ctx.logits_ith(-1).unwrap());
        assert_eq!(ctx.logits_ith(1).unwrap(), ctx.logits_ith(-2).unwrap());
        assert!(matches!(ctx.logits_ith(0), Err(LlamaError::InvalidOutput(0))));
        assert!(matches!(ctx.logits_ith(-3), Err(LlamaError::InvalidOutput(-3))));
        assert!(matches!(ctx.logits_ith(8), Err(LlamaError::InvalidOutput(8))));
    }

    #[test]
    fn invalid_batches_rejected() {
        let mut ctx = context(small());
        assert!(matches!(
            ctx.decode(&Batch::new(1, 0, 1)),
            Err(LlamaError::InvalidBatch(_))
        ));
        let bad_token = Batch::get_one(&[99], 0, 0).unwrap();
        assert!(matches!(ctx.decode(&bad_token), Err(LlamaError::InvalidBatch(_))));
        let bad_seq = Batch::get_one(&[1], 0, 3).unwrap();
        assert!(matches!(ctx.decode(&bad_seq), Err(LlamaError::InvalidBatch(_))));
        let bad_pos = Batch::get_one(&[1], -2, 0).unwrap();
        assert!(matches!(ctx.decode(&bad_pos), Err(LlamaError::InvalidBatch(_))));
        assert_eq!(ctx.kv().used_cells(), 0);
    }

    #[test]
    fn slot_exhausted_rolls_back() {
        let mut ctx = context(small());
        let tokens: Vec<TokenId> = (0..12).collect();
        ctx.decode(&Batch::get_one(&tokens, 0, 0).unwrap()).unwrap();
        let before = ctx.kv().view();

        let more: Vec<TokenId> = (0..6).collect();
        let err = ctx.decode(&Batch::get_one(&more, 12, 0).unwrap()).unwrap_err();
        assert!(matches!(err, LlamaError::SlotExhausted { .. }));
        assert!(err.is_retriable());
        assert_eq!(ctx.kv().view(), before);
    }

    #[test]
    fn abort_callback_rolls_back() {
        let mut ctx = context(small());
        ctx.decode(&Batch::get_one(&[1, 2], 0, 0).unwrap()).unwrap();
        let used = ctx.kv().used_cells();

        ctx.set_abort_callback(|| true);
        let err = ctx.decode(&Batch::get_one(&[3], 2, 0).unwrap()).unwrap_err();
        assert!(matches!(err, LlamaError::ComputeAborted));
        assert_eq!(ctx.kv().used_cells(), used);

        ctx.clear_abort_callback();
        ctx.decode(&Batch::get_one(&[3], 2, 0).unwrap()).unwrap();
        assert_eq!(ctx.kv().seq_pos_max(0), Some(2));
    }

    #[test]
    fn mean_pooling() {
        let mut ctx = context(ContextParams {
            embeddings: true,
            pooling: PoolingType::Mean,
            n_seq_max: 2,
            ..small()
        });
        let mut batch = Batch::new(4, 0, 1);
        batch.add_token(1, 0, &[0], true).unwrap();
        batch.add_token(2, 1, &[0], true).unwrap();
        batch.add_token(3, 0, &[1], true).unwrap();
        ctx.decode(&batch).unwrap();

        assert_eq!(ctx.embeddings_seq(0).unwrap().len(), 32);
        assert_ne!(ctx.embeddings_seq(0), ctx.embeddings_seq(1));
        assert!(ctx.embeddings_seq(2).is_none());
        assert!(ctx.embeddings_ith(0).is_err());
    }

    #[test]
    fn per_token_embeddings() {
        let mut ctx = context(ContextParams {
            embeddings: true,
            ..small()
        });
        ctx.decode(&Batch::get_one(&[4, 5], 0, 0).unwrap()).unwrap();
        assert_eq!(ctx.embeddings_ith(-1).unwrap().len(), 32);
        assert!(ctx.embeddings_ith(0).is_err());
    }

    #[test]
    fn encoder_conditions_decode() {
        let model = TinyModel::new(ModelConfig::tiny(32), 3).unwrap().with_encoder(true);
        let mut ctx = Context::new(Arc::new(model), small()).unwrap();
        let plain = {
            ctx.decode(&Batch::get_one(&[1], 0, 0).unwrap()).unwrap();
            ctx.logits_ith(-1).unwrap().to_vec()
        };
        ctx.reset();
        ctx.encode(&Batch::get_one(&[7, 8, 9], 0, 0).unwrap()).unwrap();
        ctx.decode(&Batch::get_one(&[1], 0, 0).unwrap()).unwrap();
        assert_ne!(ctx.logits_ith(-1).unwrap(), plain.as_slice());

        let mut no_enc = context(small());
        assert!(no_enc.encode(&Batch::get_one(&[1], 0, 0).unwrap()).is_err());
    }

    #[test]
    fn auto_defrag_requested() {
        let mut ctx = context(ContextParams {
            defrag_threshold: 0.1,
            n_seq_max: 2,
            ..small()
        });
        let mut batch = Batch::new(8, 0, 1);
        for i in 0..8 {
            batch.add_token(1, i / 2, &[i % 2], i == 7).unwrap();
        }
        ctx.decode(&batch).unwrap();
        ctx.kv_mut().seq_remove(1, -1, -1).unwrap();
        ctx.decode(&Batch::get_one(&[2], 4, 0).unwrap()).unwrap();
        assert!(ctx.kv().has_pending());
        ctx.kv_update().unwrap();
        assert_eq!(ctx.kv().fragmentation(), 0.0);
    }

    #[test]
    fn defrag_preserves_next_logits() {
        let interleaved = |defrag_threshold: f32| {
            let mut ctx = context(ContextParams {
                defrag_threshold,
                n_seq_max: 2,
                ..small()
            });
            let mut batch = Batch::new(8, 0, 1);
            for i in 0..8 {
                batch.add_token(1 + i, i / 2, &[i % 2], i == 7).unwrap();
            }
            ctx.decode(&batch).unwrap();
            ctx.kv_mut().seq_remove(1, -1, -1).unwrap();
            ctx.decode(&Batch::get_one(&[2], 4, 0).unwrap()).unwrap();
            ctx
        };
        let mut plain = interleaved(-1.0);
        let mut compacted = interleaved(0.1);
        assert!(!plain.kv().has_pending());

        let before = compacted.kv().view();
        assert!(compacted.kv_update().unwrap());
        assert_ne!(compacted.kv().view(), before);
        assert_eq!(compacted.kv().used_cells(), plain.kv().used_cells());

        for ctx in [&mut plain, &mut compacted] {
            ctx.decode(&Batch::get_one(&[3], 5, 0).unwrap()).unwrap();
        }
        let diff = plain
            .logits_ith(-1)
            .unwrap()
            .iter()
            .zip(compacted.logits_ith(-1).unwrap())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);
        assert!(diff <= 1e-5, "defrag changed logits by {diff}");
    }

    #[test]
    fn perf_counts_phases() {
        let mut ctx = context(small());
        ctx.decode(&Batch::get_one(&[1, 2, 3], 0, 0).unwrap()).unwrap();
        ctx.decode(&Batch::get_one(&[4], 3, 0).unwrap()).unwrap();
        let p = ctx.perf();
        assert_eq!(p.n_p_eval, 3);
        assert_eq!(p.n_eval, 1);
        ctx.perf_reset();
        assert_eq!(ctx.perf().n_eval, 0);
    }

    #[test]
    fn set_n_threads_validates() {
        let mut ctx = context(small());
        ctx.set_n_threads(2, 3).unwrap();
        assert_eq!((ctx.n_threads(), ctx.n_threads_batch()), (2, 3));
        assert!(ctx.set_n_threads(0, 1).is_err());
    }
}
