//! Sampler stages.

use std::collections::{HashMap, VecDeque};

use llama_engine::{TokenId, TOKEN_NULL};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::{Sampler, SamplingError, SamplingResult, TokenDataArray, DEFAULT_SEED};

fn resolve_seed(seed: u32) -> u32 {
    if seed == DEFAULT_SEED {
        rand::random()
    } else {
        seed
    }
}

/// Draw an index proportionally to `p`.
fn sample_index(cur: &TokenDataArray, rng: &mut StdRng) -> SamplingResult<usize> {
    let dist = WeightedIndex::new(cur.data.iter().map(|t| t.p))
        .map_err(|_| SamplingError::NoValidTokens)?;
    Ok(dist.sample(rng))
}

macro_rules! boxed_clone {
    () => {
        fn clone_box(&self) -> Box<dyn Sampler> {
            Box::new(self.clone())
        }
    };
}

/// Select the highest logit; ties go to the lowest token id.
#[derive(Debug, Clone, Default)]
pub struct Greedy;

impl Greedy {
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for Greedy {
    fn name(&self) -> &str {
        "greedy"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        let best = cur
            .data
            .iter()
            .enumerate()
            .reduce(|best, cand| {
                let (_, b) = best;
                let (_, c) = cand;
                if c.logit > b.logit || (c.logit == b.logit && c.id < b.id) {
                    cand
                } else {
                    best
                }
            })
            .map(|(i, _)| i)
            .ok_or(SamplingError::NoValidTokens)?;
        cur.selected = Some(best);
        Ok(())
    }

    boxed_clone!();
}

/// Normalize and draw proportionally with a seeded RNG.
#[derive(Debug, Clone)]
pub struct Dist {
    seed: u32,
    seed_cur: u32,
    rng: StdRng,
}

impl Dist {
    /// `DEFAULT_SEED` draws a random seed.
    pub fn new(seed: u32) -> Self {
        let seed_cur = resolve_seed(seed);
        Self {
            seed,
            seed_cur,
            rng: StdRng::seed_from_u64(seed_cur as u64),
        }
    }
}

impl Sampler for Dist {
    fn name(&self) -> &str {
        "dist"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        cur.normalize();
        cur.selected = Some(sample_index(cur, &mut self.rng)?);
        Ok(())
    }

    fn reset(&mut self) {
        self.seed_cur = resolve_seed(self.seed);
        self.rng = StdRng::seed_from_u64(self.seed_cur as u64);
    }

    fn seed(&self) -> Option<u32> {
        Some(self.seed_cur)
    }

    boxed_clone!();
}

/// Recompute probabilities from logits.
#[derive(Debug, Clone, Default)]
pub struct Softmax;

impl Softmax {
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for Softmax {
    fn name(&self) -> &str {
        "softmax"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        cur.normalize();
        Ok(())
    }

    boxed_clone!();
}

/// Keep the `k` highest logits; `k <= 0` disables.
#[derive(Debug, Clone)]
pub struct TopK {
    k: i32,
}

impl TopK {
    pub fn new(k: i32) -> Self {
        Self { k }
    }
}

pub(crate) fn top_k(cur: &mut TokenDataArray, k: usize) {
    let k = k.clamp(1, cur.len().max(1));
    cur.sort_by_logit();
    cur.truncate(k);
}

impl Sampler for TopK {
    fn name(&self) -> &str {
        "top-k"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.k > 0 {
            top_k(cur, self.k as usize);
        }
        Ok(())
    }

    boxed_clone!();
}

/// Smallest prefix by probability whose mass reaches `p`.
#[derive(Debug, Clone)]
pub struct TopP {
    p: f32,
    min_keep: usize,
}

impl TopP {
    pub fn new(p: f32, min_keep: usize) -> Self {
        Self { p, min_keep }
    }
}

impl Sampler for TopP {
    fn name(&self) -> &str {
        "top-p"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.p >= 1.0 {
            return Ok(());
        }
        cur.softmax();

        let mut cum = 0.0;
        let mut last = cur.len();
        for (i, t) in cur.data.iter().enumerate() {
            cum += t.p;
            if cum >= self.p && i + 1 >= self.min_keep {
                last = i + 1;
                break;
            }
        }
        cur.truncate(last);
        Ok(())
    }

    boxed_clone!();
}

/// Drop candidates less likely than `p` times the most likely one.
#[derive(Debug, Clone)]
pub struct MinP {
    p: f32,
    min_keep: usize,
}

impl MinP {
    pub fn new(p: f32, min_keep: usize) -> Self {
        Self { p, min_keep }
    }
}

impl Sampler for MinP {
    fn name(&self) -> &str {
        "min-p"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.p <= 0.0 || cur.is_empty() {
            return Ok(());
        }
        cur.sort_by_logit();
        // p_i >= p * p_max  <=>  logit_i >= logit_max + ln(p)
        let min_logit = cur.data[0].logit + self.p.ln();
        let kept = cur.data.iter().take_while(|t| t.logit >= min_logit).count();
        cur.truncate(kept.max(self.min_keep));
        Ok(())
    }

    boxed_clone!();
}

/// Tail-free sampling: cut where the normalized second derivative of the
/// sorted probabilities accumulates past `z`.
#[derive(Debug, Clone)]
pub struct TailFree {
    z: f32,
    min_keep: usize,
}

impl TailFree {
    pub fn new(z: f32, min_keep: usize) -> Self {
        Self { z, min_keep }
    }
}

impl Sampler for TailFree {
    fn name(&self) -> &str {
        "tail-free"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.z >= 1.0 || cur.len() <= 2 {
            return Ok(());
        }
        cur.softmax();

        let first: Vec<f32> = cur.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();

        let sum: f32 = second.iter().sum();
        if sum > 1e-6 {
            second.iter_mut().for_each(|d| *d /= sum);
        } else {
            let uniform = 1.0 / second.len() as f32;
            second.iter_mut().for_each(|d| *d = uniform);
        }

        let mut cum = 0.0;
        let mut last = cur.len();
        for (i, d) in second.iter().enumerate() {
            cum += d;
            if cum > self.z && i >= self.min_keep {
                last = i;
                break;
            }
        }
        cur.truncate(last);
        Ok(())
    }

    boxed_clone!();
}

/// Locally typical sampling: keep candidates whose surprisal is closest to the
/// distribution's entropy until their mass exceeds `p`.
#[derive(Debug, Clone)]
pub struct Typical {
    p: f32,
    min_keep: usize,
}

impl Typical {
    pub fn new(p: f32, min_keep: usize) -> Self {
        Self { p, min_keep }
    }
}

impl Sampler for Typical {
    fn name(&self) -> &str {
        "typical"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.p >= 1.0 {
            return Ok(());
        }
        cur.softmax();

        let entropy: f32 = cur
            .data
            .iter()
            .filter(|t| t.p > 0.0)
            .map(|t| -t.p * t.p.ln())
            .sum();

        let mut order: Vec<(usize, f32)> = cur
            .data
            .iter()
            .enumerate()
            .map(|(i, t)| (i, (-t.p.ln() - entropy).abs()))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut cum = 0.0;
        let mut last = order.len();
        for (i, &(idx, _)) in order.iter().enumerate() {
            cum += cur.data[idx].p;
            if cum > self.p && i + 1 >= self.min_keep {
                last = i + 1;
                break;
            }
        }

        cur.data = order[..last].iter().map(|&(idx, _)| cur.data[idx]).collect();
        cur.sorted = false;
        cur.selected = None;
        Ok(())
    }

    boxed_clone!();
}

/// Divide logits by `t`. `t <= 0` keeps only the maximum logit.
pub(crate) fn temp(cur: &mut TokenDataArray, t: f32) {
    if t <= 0.0 {
        let max = cur
            .data
            .iter()
            .map(|d| d.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut kept = false;
        for d in &mut cur.data {
            if d.logit == max && !kept {
                kept = true;
            } else {
                d.logit = f32::NEG_INFINITY;
            }
        }
        return;
    }
    for d in &mut cur.data {
        d.logit /= t;
    }
}

#[derive(Debug, Clone)]
pub struct Temp {
    t: f32,
}

impl Temp {
    pub fn new(t: f32) -> Self {
        Self { t }
    }
}

impl Sampler for Temp {
    fn name(&self) -> &str {
        "temp"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        temp(cur, self.t);
        Ok(())
    }

    boxed_clone!();
}

/// Entropy-adaptive temperature in `[t - delta, t + delta]`.
#[derive(Debug, Clone)]
pub struct TempExt {
    t: f32,
    delta: f32,
    exponent: f32,
}

impl TempExt {
    pub fn new(t: f32, delta: f32, exponent: f32) -> Self {
        Self { t, delta, exponent }
    }
}

impl Sampler for TempExt {
    fn name(&self) -> &str {
        "temp-ext"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.delta <= 0.0 {
            temp(cur, self.t);
            return Ok(());
        }
        if cur.len() <= 1 {
            return Ok(());
        }

        let min_temp = (self.t - self.delta).max(0.0);
        let max_temp = self.t + self.delta;

        cur.softmax();
        let max_entropy = (cur.len() as f32).ln();
        let entropy: f32 = cur
            .data
            .iter()
            .filter(|t| t.p > 0.0)
            .map(|t| -t.p * t.p.ln())
            .sum();
        let normalized = entropy / max_entropy;
        let dyn_temp = min_temp + (max_temp - min_temp) * normalized.powf(self.exponent);

        tracing::trace!(entropy, dyn_temp, "dynamic temperature");

        for d in &mut cur.data {
            d.logit /= dyn_temp;
        }
        cur.normalize();
        Ok(())
    }

    boxed_clone!();
}

/// Surprisal of a sampled token and the mu update it implies.
fn mirostat_update(mu: &mut f32, last: &[(TokenId, f32)], token: TokenId, tau: f32, eta: f32) {
    if let Some(&(_, p)) = last.iter().find(|(id, _)| *id == token) {
        let surprise = -p.log2();
        *mu -= eta * (surprise - tau);
    }
}

/// Mirostat 1.0: estimate the Zipf exponent from the top `m` candidates and
/// pick `k` so the expected surprisal tracks `tau`.
///
/// `mu` starts at `2 * tau` and is updated in `accept`.
#[derive(Debug, Clone)]
pub struct Mirostat {
    n_vocab: usize,
    seed: u32,
    seed_cur: u32,
    tau: f32,
    eta: f32,
    m: usize,
    mu: f32,
    /// Candidates of the last apply, for the surprisal lookup in `accept`.
    last: Vec<(TokenId, f32)>,
    rng: StdRng,
}

impl Mirostat {
    pub fn new(n_vocab: usize, seed: u32, tau: f32, eta: f32, m: usize) -> Self {
        let seed_cur = resolve_seed(seed);
        Self {
            n_vocab,
            seed,
            seed_cur,
            tau,
            eta,
            m,
            mu: 2.0 * tau,
            last: Vec::new(),
            rng: StdRng::seed_from_u64(seed_cur as u64),
        }
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }
}

impl Sampler for Mirostat {
    fn name(&self) -> &str {
        "mirostat"
    }

    fn accept(&mut self, token: TokenId) {
        mirostat_update(&mut self.mu, &self.last, token, self.tau, self.eta);
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if cur.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        cur.softmax();

        let n = self.m.min(cur.len());
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..n.saturating_sub(1) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (cur.data[i].p / cur.data[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;

        let eps_hat = s_hat - 1.0;
        let k = ((eps_hat * 2f32.powf(self.mu)) / (1.0 - (self.n_vocab as f32).powf(-eps_hat)))
            .powf(1.0 / s_hat);
        let k = if k.is_finite() && k >= 1.0 {
            k as usize
        } else {
            1
        };

        top_k(cur, k);
        cur.normalize();
        self.last = cur.data.iter().map(|t| (t.id, t.p)).collect();
        cur.selected = Some(sample_index(cur, &mut self.rng)?);
        Ok(())
    }

    fn reset(&mut self) {
        self.mu = 2.0 * self.tau;
        self.last.clear();
        self.seed_cur = resolve_seed(self.seed);
        self.rng = StdRng::seed_from_u64(self.seed_cur as u64);
    }

    fn seed(&self) -> Option<u32> {
        Some(self.seed_cur)
    }

    boxed_clone!();
}

/// Mirostat 2.0: drop candidates whose surprisal exceeds `mu`, then sample.
#[derive(Debug, Clone)]
pub struct MirostatV2 {
    seed: u32,
    seed_cur: u32,
    tau: f32,
    eta: f32,
    mu: f32,
    last: Vec<(TokenId, f32)>,
    rng: StdRng,
}

impl MirostatV2 {
    pub fn new(seed: u32, tau: f32, eta: f32) -> Self {
        let seed_cur = resolve_seed(seed);
        Self {
            seed,
            seed_cur,
            tau,
            eta,
            mu: 2.0 * tau,
            last: Vec::new(),
            rng: StdRng::seed_from_u64(seed_cur as u64),
        }
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }
}

impl Sampler for MirostatV2 {
    fn name(&self) -> &str {
        "mirostat-v2"
    }

    fn accept(&mut self, token: TokenId) {
        mirostat_update(&mut self.mu, &self.last, token, self.tau, self.eta);
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if cur.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        cur.softmax();

        let keep = cur
            .data
            .iter()
            .take_while(|t| -t.p.log2() <= self.mu)
            .count()
            .max(1);
        cur.truncate(keep);
        cur.normalize();

        self.last = cur.data.iter().map(|t| (t.id, t.p)).collect();
        cur.selected = Some(sample_index(cur, &mut self.rng)?);
        Ok(())
    }

    fn reset(&mut self) {
        self.mu = 2.0 * self.tau;
        self.last.clear();
        self.seed_cur = resolve_seed(self.seed);
        self.rng = StdRng::seed_from_u64(self.seed_cur as u64);
    }

    fn seed(&self) -> Option<u32> {
        Some(self.seed_cur)
    }

    boxed_clone!();
}

/// Repetition, frequency and presence penalties over the last `last_n`
/// accepted tokens.
#[derive(Debug, Clone)]
pub struct Penalties {
    eos: TokenId,
    nl: TokenId,
    last_n: usize,
    repeat: f32,
    freq: f32,
    present: f32,
    penalize_nl: bool,
    ignore_eos: bool,
    prev: VecDeque<TokenId>,
}

impl Penalties {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        eos: TokenId,
        nl: TokenId,
        last_n: usize,
        repeat: f32,
        freq: f32,
        present: f32,
        penalize_nl: bool,
        ignore_eos: bool,
    ) -> Self {
        Self {
            eos,
            nl,
            last_n,
            repeat,
            freq,
            present,
            penalize_nl,
            ignore_eos,
            prev: VecDeque::with_capacity(last_n),
        }
    }

    fn disabled(&self) -> bool {
        self.last_n == 0 || (self.repeat == 1.0 && self.freq == 0.0 && self.present == 0.0)
    }
}

impl Sampler for Penalties {
    fn name(&self) -> &str {
        "penalties"
    }

    fn accept(&mut self, token: TokenId) {
        if self.last_n == 0 {
            return;
        }
        if self.prev.len() == self.last_n {
            self.prev.pop_front();
        }
        self.prev.push_back(token);
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        if self.ignore_eos && self.eos != TOKEN_NULL {
            if let Some(t) = cur.find_mut(self.eos) {
                t.logit = f32::NEG_INFINITY;
            }
        }
        if self.disabled() {
            return Ok(());
        }

        let nl_logit = if !self.penalize_nl && self.nl != TOKEN_NULL {
            cur.find_mut(self.nl).map(|t| t.logit)
        } else {
            None
        };

        let mut counts: HashMap<TokenId, u32> = HashMap::new();
        for &tok in &self.prev {
            *counts.entry(tok).or_default() += 1;
        }

        for t in &mut cur.data {
            let Some(&count) = counts.get(&t.id) else {
                continue;
            };
            if t.logit <= 0.0 {
                t.logit *= self.repeat;
            } else {
                t.logit /= self.repeat;
            }
            t.logit -= count as f32 * self.freq + self.present;
        }
        cur.sorted = false;

        if let Some(logit) = nl_logit {
            if let Some(t) = cur.find_mut(self.nl) {
                t.logit = logit;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.prev.clear();
    }

    boxed_clone!();
}

/// Add fixed biases to specific tokens.
#[derive(Debug, Clone)]
pub struct LogitBias {
    biases: Vec<(TokenId, f32)>,
}

impl LogitBias {
    pub fn new(biases: Vec<(TokenId, f32)>) -> Self {
        Self { biases }
    }
}

impl Sampler for LogitBias {
    fn name(&self) -> &str {
        "logit-bias"
    }

    fn apply(&mut self, cur: &mut TokenDataArray) -> SamplingResult<()> {
        for &(id, bias) in &self.biases {
            if let Some(t) = cur.find_mut(id) {
                t.logit += bias;
            }
        }
        if !self.biases.is_empty() {
            cur.sorted = false;
        }
        Ok(())
    }

    boxed_clone!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(cur: &TokenDataArray) -> Vec<TokenId> {
        cur.data.iter().map(|t| t.id).collect()
    }

    fn apply(s: &mut dyn Sampler, logits: &[f32]) -> TokenDataArray {
        let mut cur = TokenDataArray::from_logits(logits);
        s.apply(&mut cur).unwrap();
        cur
    }

    #[test]
    fn greedy_ties_lowest_id() {
        let cur = apply(&mut Greedy::new(), &[1.0, 5.0, 5.0, 2.0]);
        assert_eq!(cur.selected_token(), Some(1));
    }

    #[test]
    fn greedy_empty_errors() {
        let mut cur = TokenDataArray::from_logits(&[]);
        assert_eq!(
            Greedy::new().apply(&mut cur),
            Err(SamplingError::NoValidTokens)
        );
    }

    #[test]
    fn dist_is_reproducible() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.37).sin()).collect();
        let run = || {
            let mut d = Dist::new(1234);
            (0..10)
                .map(|_| apply(&mut d, &logits).selected_token().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn dist_reset_replays() {
        let logits = [0.1, 0.2, 0.3, 0.4, 0.5];
        let mut d = Dist::new(7);
        let a: Vec<_> = (0..5).map(|_| apply(&mut d, &logits).selected_token()).collect();
        d.reset();
        let b: Vec<_> = (0..5).map(|_| apply(&mut d, &logits).selected_token()).collect();
        assert_eq!(a, b);
        assert_eq!(d.seed(), Some(7));
    }

    #[test]
    fn dist_default_seed_is_resolved() {
        let d = Dist::new(DEFAULT_SEED);
        assert!(d.seed().is_some());
    }

    #[test]
    fn dist_never_picks_masked() {
        let mut d = Dist::new(3);
        for _ in 0..20 {
            let cur = apply(&mut d, &[f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY]);
            assert_eq!(cur.selected_token(), Some(1));
        }
    }

    #[test]
    fn top_k_keeps_k() {
        let cur = apply(&mut TopK::new(2), &[0.1, 0.9, 0.5, 0.3]);
        assert_eq!(ids(&cur), vec![1, 2]);
        let cur = apply(&mut TopK::new(0), &[0.1, 0.9]);
        assert_eq!(cur.len(), 2);
        let cur = apply(&mut TopK::new(10), &[0.1, 0.9]);
        assert_eq!(cur.len(), 2);
    }

    #[test]
    fn top_p_smallest_prefix() {
        // probs ~ [0.665, 0.245, 0.090]
        let logits = [2.0, 1.0, 0.0];
        assert_eq!(apply(&mut TopP::new(0.5, 1), &logits).len(), 1);
        assert_eq!(apply(&mut TopP::new(0.8, 1), &logits).len(), 2);
        assert_eq!(apply(&mut TopP::new(0.5, 3), &logits).len(), 3);
        assert_eq!(apply(&mut TopP::new(1.0, 1), &logits).len(), 3);
    }

    #[test]
    fn min_p_relative_threshold() {
        // p ratio to max: 1, e^-1 ~ 0.37, e^-3 ~ 0.05
        let logits = [3.0, 2.0, 0.0];
        let cur = apply(&mut MinP::new(0.2, 1), &logits);
        assert_eq!(ids(&cur), vec![0, 1]);
        let cur = apply(&mut MinP::new(0.5, 1), &logits);
        assert_eq!(ids(&cur), vec![0]);
        let cur = apply(&mut MinP::new(0.5, 2), &logits);
        assert_eq!(cur.len(), 2);
    }

    #[test]
    fn tail_free_cuts_flat_tail() {
        let logits = [5.0, 4.9, 1.0, 0.9, 0.8, 0.7];
        let cur = apply(&mut TailFree::new(0.5, 1), &logits);
        assert!(cur.len() < logits.len());
        assert_eq!(cur.data[0].id, 0);
        assert_eq!(apply(&mut TailFree::new(1.0, 1), &logits).len(), 6);
    }

    #[test]
    fn typical_keeps_mass() {
        let logits = [3.0, 2.0, 1.0, 0.0, -1.0];
        let cur = apply(&mut Typical::new(0.5, 1), &logits);
        assert!(!cur.is_empty() && cur.len() < logits.len());
        assert!(!cur.sorted);
        assert_eq!(apply(&mut Typical::new(1.0, 1), &logits).len(), 5);
    }

    #[test]
    fn temp_scales_logits() {
        let cur = apply(&mut Temp::new(2.0), &[2.0, 4.0]);
        assert_eq!(cur.data[0].logit, 1.0);
        assert_eq!(cur.data[1].logit, 2.0);
    }

    #[test]
    fn temp_zero_keeps_argmax() {
        let cur = apply(&mut Temp::new(0.0), &[2.0, 4.0, 4.0]);
        assert_eq!(cur.data[1].logit, 4.0);
        assert_eq!(cur.data[0].logit, f32::NEG_INFINITY);
        assert_eq!(cur.data[2].logit, f32::NEG_INFINITY);
    }

    #[test]
    fn temp_ext_without_delta_is_plain_temp() {
        let a = apply(&mut TempExt::new(0.5, 0.0, 1.0), &[1.0, 2.0]);
        let b = apply(&mut Temp::new(0.5), &[1.0, 2.0]);
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn temp_ext_sharpens_low_entropy() {
        // Peaked distribution: entropy low, temperature near t - delta.
        let cur = apply(&mut TempExt::new(1.0, 0.5, 1.0), &[10.0, 0.0, 0.0, 0.0]);
        assert!(cur.data[0].p > 0.99);
        let sum: f32 = cur.data.iter().map(|t| t.p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mirostat_v2_updates_mu_on_accept() {
        let logits = [2.0, 1.0, 0.5, 0.0];
        let mut m = MirostatV2::new(42, 5.0, 0.1);
        assert_eq!(m.mu(), 10.0);
        let cur = apply(&mut m, &logits);
        let tok = cur.selected_token().unwrap();
        let p = cur.data.iter().find(|t| t.id == tok).unwrap().p;
        m.accept(tok);
        let expected = 10.0 - 0.1 * (-p.log2() - 5.0);
        assert!((m.mu() - expected).abs() < 1e-5);
        m.reset();
        assert_eq!(m.mu(), 10.0);
    }

    #[test]
    fn mirostat_v2_low_mu_truncates() {
        let mut m = MirostatV2::new(1, 0.1, 0.1);
        let cur = apply(&mut m, &[3.0, 2.0, 1.0, 0.0]);
        assert_eq!(cur.len(), 1);
        assert_eq!(cur.selected_token(), Some(0));
    }

    #[test]
    fn mirostat_v1_selects_and_learns() {
        let logits: Vec<f32> = (0..32).map(|i| -(i as f32) * 0.5).collect();
        let mut m = Mirostat::new(32, 9, 3.0, 0.1, 100);
        let cur = apply(&mut m, &logits);
        let tok = cur.selected_token().unwrap();
        let before = m.mu();
        m.accept(tok);
        assert_ne!(m.mu(), before);
    }

    #[test]
    fn penalties_window_of_three() {
        let mut pen = Penalties::new(TOKEN_NULL, TOKEN_NULL, 3, 1.5, 0.1, 0.1, true, false);
        for _ in 0..3 {
            pen.accept(4);
        }
        let cur = apply(&mut pen, &[1.0; 6]);
        let repeated = cur.data[4].logit;
        let fresh = cur.data[5].logit;
        assert!(repeated < fresh);
        // 1.0 / 1.5 - (3 * 0.1 + 0.1)
        assert!((repeated - (1.0 / 1.5 - 0.4)).abs() < 1e-6);
    }

    #[test]
    fn penalties_window_forgets() {
        let mut pen = Penalties::new(TOKEN_NULL, TOKEN_NULL, 2, 2.0, 0.0, 0.0, true, false);
        pen.accept(0);
        pen.accept(1);
        pen.accept(2);
        let cur = apply(&mut pen, &[1.0, 1.0, 1.0]);
        assert_eq!(cur.data[0].logit, 1.0);
        assert_eq!(cur.data[1].logit, 0.5);
        assert_eq!(cur.data[2].logit, 0.5);
    }

    #[test]
    fn penalties_negative_logit_pushed_down() {
        let mut pen = Penalties::new(TOKEN_NULL, TOKEN_NULL, 4, 2.0, 0.0, 0.0, true, false);
        pen.accept(0);
        let cur = apply(&mut pen, &[-1.0, -1.0]);
        assert_eq!(cur.data[0].logit, -2.0);
    }

    #[test]
    fn penalties_exempt_newline_and_ignore_eos() {
        let nl = 1;
        let eos = 2;
        let mut pen = Penalties::new(eos, nl, 8, 2.0, 0.0, 0.0, false, true);
        pen.accept(nl);
        pen.accept(0);
        let cur = apply(&mut pen, &[1.0, 1.0, 1.0]);
        assert_eq!(cur.data[0].logit, 0.5);
        assert_eq!(cur.data[1].logit, 1.0);
        assert_eq!(cur.data[2].logit, f32::NEG_INFINITY);
    }

    #[test]
    fn logit_bias_after_reorder() {
        let mut cur = TokenDataArray::from_logits(&[0.0, 1.0, 2.0]);
        cur.softmax();
        LogitBias::new(vec![(0, 5.0), (99, 1.0)])
            .apply(&mut cur)
            .unwrap();
        assert_eq!(cur.data.iter().find(|t| t.id == 0).unwrap().logit, 5.0);
        assert!(!cur.sorted);
    }

    #[test]
    fn clone_box_copies_state() {
        let mut pen = Penalties::new(TOKEN_NULL, TOKEN_NULL, 3, 2.0, 0.0, 0.0, true, false);
        pen.accept(0);
        let mut copy = pen.clone_box();
        let cur = {
            let mut cur = TokenDataArray::from_logits(&[1.0, 1.0]);
            copy.apply(&mut cur).unwrap();
            cur
        };
        assert_eq!(cur.data[0].logit, 0.5);
        assert_eq!(copy.name(), "penalties");
    }
}
