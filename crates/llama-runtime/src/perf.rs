//! Context performance counters.
//!
//! Diagnostic only: nothing in the runtime depends on these values.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Snapshot of a context's counters, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfContextData {
    /// Wall-clock creation time since the Unix epoch.
    pub t_start_ms: f64,
    /// Time spent building the context.
    pub t_load_ms: f64,
    /// Prompt evaluation (multi-token decode calls).
    pub t_p_eval_ms: f64,
    /// Generation (single-token decode calls).
    pub t_eval_ms: f64,
    pub n_p_eval: u64,
    pub n_eval: u64,
}

impl PerfContextData {
    /// Prompt throughput.
    pub fn prompt_tokens_per_sec(&self) -> f64 {
        rate(self.n_p_eval, self.t_p_eval_ms)
    }

    /// Generation throughput.
    pub fn tokens_per_sec(&self) -> f64 {
        rate(self.n_eval, self.t_eval_ms)
    }
}

fn rate(n: u64, ms: f64) -> f64 {
    if ms > 0.0 && n > 0 {
        n as f64 / (ms / 1000.0)
    } else {
        0.0
    }
}

/// Accumulates phase timings.
#[derive(Debug, Clone)]
pub(crate) struct PerfCounters {
    enabled: bool,
    t_start: f64,
    created: Instant,
    t_load: Duration,
    t_p_eval: Duration,
    t_eval: Duration,
    n_p_eval: u64,
    n_eval: u64,
}

impl PerfCounters {
    pub(crate) fn new(enabled: bool) -> Self {
        let t_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        Self {
            enabled,
            t_start,
            created: Instant::now(),
            t_load: Duration::ZERO,
            t_p_eval: Duration::ZERO,
            t_eval: Duration::ZERO,
            n_p_eval: 0,
            n_eval: 0,
        }
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.t_load = self.created.elapsed();
    }

    /// Record one decode/encode call of `n_tokens`.
    pub(crate) fn record(&mut self, n_tokens: usize, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        if n_tokens > 1 {
            self.t_p_eval += elapsed;
            self.n_p_eval += n_tokens as u64;
        } else {
            self.t_eval += elapsed;
            self.n_eval += 1;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.t_p_eval = Duration::ZERO;
        self.t_eval = Duration::ZERO;
        self.n_p_eval = 0;
        self.n_eval = 0;
    }

    pub(crate) fn snapshot(&self) -> PerfContextData {
        PerfContextData {
            t_start_ms: self.t_start,
            t_load_ms: self.t_load.as_secs_f64() * 1000.0,
            t_p_eval_ms: self.t_p_eval.as_secs_f64() * 1000.0,
            t_eval_ms: self.t_eval.as_secs_f64() * 1000.0,
            n_p_eval: self.n_p_eval,
            n_eval: self.n_eval,
        }
    }
}
