//! Serde sampling configuration and the canonical chain built from it.

use llama_engine::TokenId;
use llama_tokenizer::Vocab;
use serde::{Deserialize, Serialize};

use crate::{
    Dist, Greedy, GrammarSampler, LogitBias, MinP, Mirostat, MirostatV2, Penalties,
    SamplerChain, SamplingError, SamplingResult, TailFree, Temp, TempExt, TopK, TopP, Typical,
    DEFAULT_SEED,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitBiasEntry {
    pub token: TokenId,
    pub bias: f32,
}

/// Sampling configuration, typically read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub seed: u32,
    /// Candidates kept by every truncating stage at minimum.
    pub min_keep: usize,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typ_p: f32,
    /// `<= 0` selects greedy decoding.
    pub temp: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    /// Last n tokens to penalize; 0 disables, -1 means the context size.
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub penalize_nl: bool,
    pub ignore_eos: bool,
    /// 0 = off, 1 = Mirostat, 2 = Mirostat 2.0
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub logit_bias: Vec<LogitBiasEntry>,
    /// GBNF source; empty disables.
    pub grammar: String,
    pub grammar_root: String,
    pub no_perf: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            min_keep: 0,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            tfs_z: 1.0,
            typ_p: 1.0,
            temp: 0.8,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            penalize_nl: false,
            ignore_eos: false,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            logit_bias: Vec::new(),
            grammar: String::new(),
            grammar_root: "root".to_string(),
            no_perf: false,
        }
    }
}

impl SamplerChain {
    /// Canonical chain:
    /// logit-bias → penalties → grammar → (mirostat | top-k → tail-free →
    /// typical → top-p → min-p → temp-ext → dist), or greedy when `temp <= 0`.
    ///
    /// `n_ctx` resolves `penalty_last_n == -1`.
    pub fn from_params(
        params: &SamplingParams,
        vocab: &dyn Vocab,
        n_ctx: usize,
    ) -> SamplingResult<Self> {
        let n_vocab = vocab.n_vocab();
        let mut chain = SamplerChain::new().with_no_perf(params.no_perf);

        if !params.logit_bias.is_empty() {
            if let Some(bad) = params
                .logit_bias
                .iter()
                .find(|b| b.token < 0 || b.token as usize >= n_vocab)
            {
                return Err(SamplingError::InvalidParameter(format!(
                    "logit bias token {} outside vocabulary",
                    bad.token
                )));
            }
            chain = chain.with(LogitBias::new(
                params.logit_bias.iter().map(|b| (b.token, b.bias)).collect(),
            ));
        }

        let last_n = match params.penalty_last_n {
            -1 => n_ctx,
            n if n < -1 => {
                return Err(SamplingError::InvalidParameter(format!(
                    "penalty_last_n must be >= -1, got {n}"
                )))
            }
            n => n as usize,
        };
        chain = chain.with(Penalties::new(
            vocab.eos(),
            vocab.nl(),
            last_n,
            params.penalty_repeat,
            params.penalty_freq,
            params.penalty_present,
            params.penalize_nl,
            params.ignore_eos,
        ));

        if !params.grammar.is_empty() {
            chain = chain.with(GrammarSampler::new(
                vocab,
                &params.grammar,
                &params.grammar_root,
            )?);
        }

        if params.temp <= 0.0 {
            return Ok(chain.with(Greedy::new()));
        }

        chain = match params.mirostat {
            0 => chain
                .with(TopK::new(params.top_k))
                .with(TailFree::new(params.tfs_z, params.min_keep))
                .with(Typical::new(params.typ_p, params.min_keep))
                .with(TopP::new(params.top_p, params.min_keep))
                .with(MinP::new(params.min_p, params.min_keep))
                .with(TempExt::new(
                    params.temp,
                    params.dynatemp_range,
                    params.dynatemp_exponent,
                ))
                .with(Dist::new(params.seed)),
            1 => chain.with(Temp::new(params.temp)).with(Mirostat::new(
                n_vocab,
                params.seed,
                params.mirostat_tau,
                params.mirostat_eta,
                100,
            )),
            2 => chain.with(Temp::new(params.temp)).with(MirostatV2::new(
                params.seed,
                params.mirostat_tau,
                params.mirostat_eta,
            )),
            m => {
                return Err(SamplingError::InvalidParameter(format!(
                    "unknown mirostat version {m}"
                )))
            }
        };
        Ok(chain)
    }
}
