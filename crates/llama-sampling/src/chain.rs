//! Ordered, owning sampler pipeline.

use std::time::{Duration, Instant};

use llama_engine::TokenId;

use crate::{Sampler, SamplingError, SamplingResult, TokenDataArray, DEFAULT_SEED};

/// Sampling performance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfSamplerData {
    pub t_sample_ms: f64,
    pub n_sample: u64,
}

/// Owns its stages; `apply` runs them in insertion order on one candidate array.
///
/// The chain is itself a [`Sampler`], so chains nest.
#[derive(Debug)]
pub struct SamplerChain {
    samplers: Vec<Box<dyn Sampler>>,
    no_perf: bool,
    t_sample: Duration,
    n_sample: u64,
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerChain {
    pub fn new() -> Self {
        Self {
            samplers: Vec::new(),
            no_perf: false,
            t_sample: Duration::ZERO,
            n_sample: 0,
        }
    }

    /// Disable timing.
    pub fn with_no_perf(mut self, no_perf: bool) -> Self {
        self.no_perf = no_perf;
        self
    }

    /// Take ownership of `sampler` and append it.
    pub fn add(&mut self, sampler: Box<dyn Sampler>) {
        self.samplers.push(sampler);
    }

    /// Builder form of [`SamplerChain::add`].
    pub fn with(mut self, sampler: impl Sampler + 'static) -> Self {
        self.add(Box::new(sampler));
        self
    }

    pub fn get(&self, i: usize) -> Option<&dyn Sampler> {
        self.samplers.get(i).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Detach stage `i`; ownership returns to the caller.
    pub fn remove(&mut self, i: usize) -> Option<Box<dyn Sampler>> {
        (i < self.samplers.len()).then(|| self.samplers.remove(i))
    }

    /// Stage names in order, e.g. `["top-k", "temp", "dist"]`.
    pub fn names(&self) -> Vec<&str> {
        self.samplers.iter().map(|s| s.name()).collect()
    }

    /// Build candidates from `logits`, apply, accept the selection and return it.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        let start = Instant::now();

        let mut cur = TokenDataArray::from_logits(logits);
        self.apply(&mut cur)?;
        let token = cur.selected_token().ok_or(SamplingError::NoSelection)?;
        self.accept(token);

        if !self.no_perf {
            self.t_sample += start.elapsed();
            self.n_sample += 1;
        }
        Ok(token)
    }

    pub fn perf(&self) -> PerfSamplerData {
        PerfSamplerData {
            t_sample_ms: self.t_sample.as_secs_f64() * 1e3,
            n_sample: self.n_sample,
        }
    }

    pub fn perf_reset(&mut self) {
        self.t_sample = Duration::ZERO;
        self.n_sample = 0;
    }

    pub fn perf_print(&self) {
        let perf = self.perf();
        let per_token = if perf.n_sample > 0 {
            perf.t_sample_ms / perf.n_sample as f64
        } else {
            0.0
        };
        tracing::info!(
            t_sample_ms = perf.t_sample_ms,
            n_sample = perf.n_sample,
            ms_per_token = per_token,
            "sampling time"
        );
    }
}

impl Clone for SamplerChain {
    fn clone(&self) -> Self {
        Self {
            samplers: self.samplers.iter().map(|s| s.clone_box()).collect(),
            no_perf: self.no_perf,
            t_sample: self.t_sample,
            n_sample: self.n_sample,
        }
    }
}

impl Sampler for SamplerChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn accept(&mut self, token: TokenId) {
        for s in &mut self.samplers {
            s.accept(token);
        }
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        for s in &mut self.samplers {
            s.apply(cur)?;
        }
        Ok(())
    }

    /// Reset every stage and the perf counters.
    fn reset(&mut self) {
        for s in &mut self.samplers {
            s.reset();
        }
        self.perf_reset();
    }

    fn clone_box(&self) -> Box<dyn Sampler> {
        Box::new(self.clone())
    }

    /// Seed of the first seeded stage.
    fn seed(&self) -> Option<u32> {
        self.samplers.iter().find_map(|s| s.seed())
    }
}

impl SamplerChain {
    /// Seed of the first seeded stage, or [`DEFAULT_SEED`].
    pub fn get_seed(&self) -> u32 {
        Sampler::seed(self).unwrap_or(DEFAULT_SEED)
    }
}
