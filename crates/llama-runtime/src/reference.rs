//! Deterministic CPU reference backend.
//!
//! A small pre-norm transformer (RMSNorm → GQA attention with RoPE → SwiGLU)
//! with weights drawn from a seeded RNG. It exists to drive the context end to
//! end: same seed, same weights, same logits.

use llama_engine::{LlamaError, Pos, Result, SeqId};
use llama_kv::{KVCache, KVCapabilities};
use llama_models::{attention, matvec, swiglu, ModelConfig, RMSNorm, RoPE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::backend::{AbortFn, ComputeBackend, ForwardOutput, ForwardStep, ModelHparams, StepInput};

#[derive(Debug, Clone)]
struct LayerWeights {
    attn_norm: RMSNorm,
    wq: Vec<f32>,
    wk: Vec<f32>,
    wv: Vec<f32>,
    wo: Vec<f32>,
    ffn_norm: RMSNorm,
    w_gate: Vec<f32>,
    w_up: Vec<f32>,
    w_down: Vec<f32>,
}

/// Seeded reference model.
#[derive(Debug, Clone)]
pub struct TinyModel {
    config: ModelConfig,
    hparams: ModelHparams,
    tok_embd: Vec<f32>,
    layers: Vec<LayerWeights>,
    output_norm: RMSNorm,
    output: Vec<f32>,
    rope: RoPE,
}

/// `rows x cols`, uniform in `±1/sqrt(cols)`.
fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<f32> {
    let bound = 1.0 / (cols as f32).sqrt();
    (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect()
}

fn add_in_place(x: &mut [f32], y: &[f32]) {
    for (a, b) in x.iter_mut().zip(y) {
        *a += b;
    }
}

/// Per-token projections for one layer.
struct Qkv {
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
}

impl TinyModel {
    /// Build a model with weights drawn from `seed`.
    ///
    /// # Errors
    /// - `InvalidArgument`: The configuration is inconsistent
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self> {
        config
            .validate()
            .map_err(|e| LlamaError::InvalidArgument(e.to_string()))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.d_model;
        let kv = config.kv_dim();

        let tok_embd = (0..config.vocab_size * d)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let layers = (0..config.n_layers)
            .map(|_| LayerWeights {
                attn_norm: RMSNorm::new(d, config.norm_eps),
                wq: random_matrix(&mut rng, d, d),
                wk: random_matrix(&mut rng, kv, d),
                wv: random_matrix(&mut rng, kv, d),
                wo: random_matrix(&mut rng, d, d),
                ffn_norm: RMSNorm::new(d, config.norm_eps),
                w_gate: random_matrix(&mut rng, config.d_ff, d),
                w_up: random_matrix(&mut rng, config.d_ff, d),
                w_down: random_matrix(&mut rng, d, config.d_ff),
            })
            .collect();
        let output = random_matrix(&mut rng, config.vocab_size, d);

        let hparams = ModelHparams {
            n_vocab: config.vocab_size,
            n_embd: d,
            n_layer: config.n_layers,
            n_embd_k: kv,
            n_embd_v: kv,
            n_ctx_train: config.max_seq_len,
            has_encoder: false,
            capabilities: KVCapabilities::ATTENTION,
        };

        tracing::debug!(
            n_vocab = config.vocab_size,
            n_embd = d,
            n_layer = config.n_layers,
            seed,
            "built reference model"
        );

        Ok(Self {
            rope: RoPE::new(config.head_dim(), config.rope_base),
            output_norm: RMSNorm::new(d, config.norm_eps),
            config,
            hparams,
            tok_embd,
            layers,
            output,
        })
    }

    /// Report an encoder; [`ComputeBackend::encode`] then runs the layers
    /// bidirectionally and decode conditions on the pooled result.
    pub fn with_encoder(mut self, has_encoder: bool) -> Self {
        self.hparams.has_encoder = has_encoder;
        self
    }

    /// Override the cache capabilities (e.g. [`KVCapabilities::RECURRENT`]).
    pub fn with_capabilities(mut self, capabilities: KVCapabilities) -> Self {
        self.hparams.capabilities = capabilities;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn input_rows(&self, step: &ForwardStep<'_>) -> Result<Vec<Vec<f32>>> {
        let d = self.config.d_model;
        let mut rows = match step.input {
            StepInput::Tokens(tokens) => tokens
                .iter()
                .map(|&t| {
                    let t = usize::try_from(t)
                        .ok()
                        .filter(|&t| t < self.config.vocab_size)
                        .ok_or_else(|| LlamaError::InvalidBatch(format!("token {t} outside vocabulary")))?;
                    Ok(self.tok_embd[t * d..(t + 1) * d].to_vec())
                })
                .collect::<Result<Vec<_>>>()?,
            StepInput::Embeddings(embd) => {
                if embd.len() != step.n_tokens() * d {
                    return Err(LlamaError::InvalidBatch(format!(
                        "expected {} embedding values, got {}",
                        step.n_tokens() * d,
                        embd.len()
                    )));
                }
                embd.chunks_exact(d).map(<[f32]>::to_vec).collect()
            }
        };
        if let Some(cross) = step.cross {
            for row in &mut rows {
                add_in_place(row, cross);
            }
        }
        Ok(rows)
    }

    fn project(&self, lw: &LayerWeights, x: &[f32], pos: Pos) -> Result<Qkv> {
        let h = lw.attn_norm.forward(x)?;
        let mut q = matvec(&lw.wq, &h, self.config.d_model)?;
        let mut k = matvec(&lw.wk, &h, self.config.kv_dim())?;
        let v = matvec(&lw.wv, &h, self.config.kv_dim())?;
        self.rope.rotate(&mut q, pos);
        self.rope.rotate(&mut k, pos);
        Ok(Qkv { q, k, v })
    }

    /// Attention output projection plus the feedforward block, both residual.
    fn finish_layer(&self, lw: &LayerWeights, x: &mut [f32], attn: &[f32]) -> Result<()> {
        add_in_place(x, &matvec(&lw.wo, attn, self.config.d_model)?);
        let h = lw.ffn_norm.forward(x)?;
        let gate = matvec(&lw.w_gate, &h, self.config.d_ff)?;
        let up = matvec(&lw.w_up, &h, self.config.d_ff)?;
        add_in_place(x, &matvec(&lw.w_down, &swiglu(&gate, &up), self.config.d_model)?);
        Ok(())
    }

    fn final_hidden(&self, rows: &[Vec<f32>]) -> Result<Vec<f32>> {
        let mut hidden = Vec::with_capacity(rows.len() * self.config.d_model);
        for x in rows {
            hidden.extend(self.output_norm.forward(x)?);
        }
        Ok(hidden)
    }
}

impl ComputeBackend for TinyModel {
    fn hparams(&self) -> &ModelHparams {
        &self.hparams
    }

    fn forward(
        &self,
        step: &ForwardStep<'_>,
        kv: &mut KVCache,
        abort: &mut AbortFn<'_>,
    ) -> Result<ForwardOutput> {
        let mut x = self.input_rows(step)?;
        let (n_heads, n_kv_heads, head_dim) =
            (self.config.n_heads, self.config.n_kv_heads, self.config.head_dim());

        for (il, lw) in self.layers.iter().enumerate() {
            if abort() {
                return Err(LlamaError::ComputeAborted);
            }

            let qkv = x
                .par_iter()
                .zip(step.positions.par_iter())
                .map(|(xi, &pos)| self.project(lw, xi, pos))
                .collect::<Result<Vec<_>>>()?;
            for (i, p) in qkv.iter().enumerate() {
                kv.write_kv(il, step.first_cell + i, &p.k, &p.v)?;
            }

            let cache: &KVCache = kv;
            let layer = cache
                .layer(il)
                .ok_or_else(|| LlamaError::ComputeError(format!("cache has no layer {il}")))?;
            let attn: Vec<Vec<f32>> = qkv
                .par_iter()
                .enumerate()
                .map(|(i, p)| {
                    let seq: SeqId = step.seq_ids[i].first().copied().unwrap_or(0);
                    let visible: Vec<usize> = (0..cache.n_cells())
                        .filter(|&c| cache.attends(c, seq, step.positions[i]))
                        .collect();
                    let keys: Vec<&[f32]> = visible.iter().map(|&c| layer.k_row(c)).collect();
                    let values: Vec<&[f32]> = visible.iter().map(|&c| layer.v_row(c)).collect();
                    attention(&p.q, &keys, &values, n_heads, n_kv_heads, head_dim)
                })
                .collect();

            x.par_iter_mut()
                .zip(attn.par_iter())
                .try_for_each(|(xi, a)| self.finish_layer(lw, xi, a))?;
        }

        let hidden = self.final_hidden(&x)?;
        let d = self.config.d_model;
        let mut logits = Vec::with_capacity(step.n_outputs() * self.config.vocab_size);
        for (i, _) in step.outputs.iter().enumerate().filter(|(_, o)| **o) {
            logits.extend(matvec(&self.output, &hidden[i * d..(i + 1) * d], self.config.vocab_size)?);
        }

        if logits.iter().any(|v| !v.is_finite()) {
            return Err(LlamaError::ComputeError("non-finite logits".to_string()));
        }
        Ok(ForwardOutput { logits, hidden })
    }

    fn encode(&self, step: &ForwardStep<'_>, abort: &mut AbortFn<'_>) -> Result<Vec<f32>> {
        if !self.hparams.has_encoder {
            return Err(LlamaError::ComputeError("model has no encoder".to_string()));
        }
        let mut x = self.input_rows(&ForwardStep { cross: None, ..*step })?;
        let (n_heads, n_kv_heads, head_dim) =
            (self.config.n_heads, self.config.n_kv_heads, self.config.head_dim());

        for lw in &self.layers {
            if abort() {
                return Err(LlamaError::ComputeAborted);
            }
            let qkv = x
                .par_iter()
                .zip(step.positions.par_iter())
                .map(|(xi, &pos)| self.project(lw, xi, pos))
                .collect::<Result<Vec<_>>>()?;

            // Bidirectional within each sequence.
            let attn: Vec<Vec<f32>> = qkv
                .par_iter()
                .enumerate()
                .map(|(i, p)| {
                    let seq = step.seq_ids[i].first().copied().unwrap_or(0);
                    let peers: Vec<usize> = (0..qkv.len())
                        .filter(|&j| step.seq_ids[j].contains(&seq))
                        .collect();
                    let keys: Vec<&[f32]> = peers.iter().map(|&j| qkv[j].k.as_slice()).collect();
                    let values: Vec<&[f32]> = peers.iter().map(|&j| qkv[j].v.as_slice()).collect();
                    attention(&p.q, &keys, &values, n_heads, n_kv_heads, head_dim)
                })
                .collect();

            x.par_iter_mut()
                .zip(attn.par_iter())
                .try_for_each(|(xi, a)| self.finish_layer(lw, xi, a))?;
        }
        self.final_hidden(&x)
    }

    fn shift_key(&self, _layer: usize, k_row: &mut [f32], delta: Pos) {
        self.rope.rotate(k_row, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_kv::KVCacheConfig;

    fn model() -> TinyModel {
        TinyModel::new(ModelConfig::tiny(16), 7).unwrap()
    }

    fn cache(m: &TinyModel) -> KVCache {
        let hp = m.hparams();
        KVCache::new(KVCacheConfig {
            n_cells: 16,
            n_layer: hp.n_layer,
            n_embd_k: hp.n_embd_k,
            n_embd_v: hp.n_embd_v,
            n_seq_max: 1,
            capabilities: hp.capabilities,
        })
    }

    fn run(m: &TinyModel, kv: &mut KVCache, tokens: &[i32], pos0: Pos) -> ForwardOutput {
        let positions: Vec<Pos> = (pos0..pos0 + tokens.len() as Pos).collect();
        let seq: &[SeqId] = &[0];
        let seqs = vec![seq; tokens.len()];
        let entries: Vec<(Pos, &[SeqId])> = positions.iter().map(|&p| (p, seq)).collect();
        let first_cell = kv.find_slot(&entries).unwrap();
        let outputs = vec![true; tokens.len()];
        let step = ForwardStep {
            input: StepInput::Tokens(tokens),
            positions: &positions,
            seq_ids: &seqs,
            outputs: &outputs,
            first_cell,
            cross: None,
        };
        m.forward(&step, kv, &mut || false).unwrap()
    }

    #[test]
    fn same_seed_same_weights() {
        let a = model();
        let b = model();
        assert_eq!(a.tok_embd, b.tok_embd);
        assert_eq!(a.output, b.output);
        let c = TinyModel::new(ModelConfig::tiny(16), 8).unwrap();
        assert_ne!(a.tok_embd, c.tok_embd);
    }

    #[test]
    fn forward_shapes() {
        let m = model();
        let mut kv = cache(&m);
        let out = run(&m, &mut kv, &[1, 2, 3], 0);
        assert_eq!(out.logits.len(), 3 * 16);
        assert_eq!(out.hidden.len(), 3 * 32);
        assert!(out.logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn abort_stops_forward() {
        let m = model();
        let mut kv = cache(&m);
        let seq: &[SeqId] = &[0];
        let first_cell = kv.find_slot(&[(0, seq)]).unwrap();
        let step = ForwardStep {
            input: StepInput::Tokens(&[1]),
            positions: &[0],
            seq_ids: &[seq],
            outputs: &[true],
            first_cell,
            cross: None,
        };
        let err = m.forward(&step, &mut kv, &mut || true).unwrap_err();
        assert!(matches!(err, LlamaError::ComputeAborted));
    }

    #[test]
    fn encoder_requires_flag() {
        let m = model();
        let seq: &[SeqId] = &[0];
        let step = ForwardStep {
            input: StepInput::Tokens(&[1]),
            positions: &[0],
            seq_ids: &[seq],
            outputs: &[true],
            first_cell: 0,
            cross: None,
        };
        assert!(m.encode(&step, &mut || false).is_err());
        let enc = m.with_encoder(true);
        assert_eq!(enc.encode(&step, &mut || false).unwrap().len(), 32);
    }
}
