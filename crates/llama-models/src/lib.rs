//! # llama-models
//!
//! f32 kernels for the reference transformer backend.
//!
//! Provides:
//! - **RMSNorm**: Root Mean Square layer normalization
//! - **RoPE**: Rotary Position Embeddings, including re-rotation of cached keys
//! - **Attention**: Grouped-query attention over already-masked cache rows
//! - **MLP**: SwiGLU feedforward
//! - **ModelConfig**: Geometry of a transformer

use llama_engine::{LlamaError, Pos};

/// Error type for kernel and configuration checks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("Invalid model config: {0}")]
    InvalidConfig(String),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

impl From<ModelError> for LlamaError {
    fn from(err: ModelError) -> Self {
        LlamaError::ComputeError(err.to_string())
    }
}

/// Root Mean Square Layer Normalization.
///
/// Formula: `y = x / RMS(x) * weight`, where RMS(x) = sqrt(mean(x^2) + eps)
///
/// # References
/// - Zhang & Sennrich (2019): "Root Mean Square Layer Normalization"
#[derive(Debug, Clone)]
pub struct RMSNorm {
    /// Learnable scale parameter, shape: [d_model]
    pub weight: Vec<f32>,
    /// Epsilon for numerical stability
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(d_model: usize, eps: f32) -> Self {
        Self {
            weight: vec![1.0; d_model],
            eps,
        }
    }

    pub fn with_weight(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    /// Normalize one row.
    pub fn forward(&self, x: &[f32]) -> ModelResult<Vec<f32>> {
        if x.len() != self.weight.len() {
            return Err(ModelError::ShapeMismatch {
                expected: self.weight.len(),
                got: x.len(),
            });
        }
        let mean_sq: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let inv_rms = 1.0 / (mean_sq + self.eps).sqrt();
        Ok(x
            .iter()
            .zip(&self.weight)
            .map(|(&v, &w)| v * inv_rms * w)
            .collect())
    }
}

/// Rotary Position Embeddings (RoPE).
///
/// Rotates each `(x[2i], x[2i+1])` pair of a head by `pos * inv_freq[i]`.
/// Rotations compose additively, so a cached key rotated at position `p` can
/// be moved to `p + delta` by rotating it again by `delta`.
///
/// # References
/// - Su et al. (2021): "RoFormer: Enhanced Transformer with Rotary Position Embedding"
#[derive(Debug, Clone)]
pub struct RoPE {
    /// Dimension of head (head_dim)
    pub dim: usize,
    /// Base for frequency calculation (default: 10000)
    pub base: f32,
    /// Inverse frequencies: [1/base^(2i/dim) for i in 0..dim/2]
    pub inv_freq: Vec<f32>,
}

impl RoPE {
    /// # Panics
    /// If `dim` is odd.
    pub fn new(dim: usize, base: f32) -> Self {
        assert!(dim % 2 == 0, "Head dimension must be even for RoPE");

        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / dim as f32))
            .collect();

        Self { dim, base, inv_freq }
    }

    /// Rotate every head of `x` (`n_heads * dim` values) in place by `pos`.
    pub fn rotate(&self, x: &mut [f32], pos: Pos) {
        for head in x.chunks_exact_mut(self.dim) {
            for (i, &freq) in self.inv_freq.iter().enumerate() {
                let angle = pos as f32 * freq;
                let (sin, cos) = angle.sin_cos();
                let x0 = head[2 * i];
                let x1 = head[2 * i + 1];
                head[2 * i] = x0 * cos - x1 * sin;
                head[2 * i + 1] = x0 * sin + x1 * cos;
            }
        }
    }
}

/// `w` is `[rows, x.len()]` row-major.
pub fn matvec(w: &[f32], x: &[f32], rows: usize) -> ModelResult<Vec<f32>> {
    let cols = x.len();
    if w.len() != rows * cols {
        return Err(ModelError::ShapeMismatch {
            expected: rows * cols,
            got: w.len(),
        });
    }
    Ok(w
        .chunks_exact(cols)
        .map(|row| row.iter().zip(x).map(|(a, b)| a * b).sum())
        .collect())
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// `silu(gate) * up`, elementwise.
pub fn swiglu(gate: &[f32], up: &[f32]) -> Vec<f32> {
    gate.iter().zip(up).map(|(&g, &u)| silu(g) * u).collect()
}

/// Numerically stable softmax in place.
pub fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Grouped-query attention for one query token.
///
/// `keys`/`values` are the visible cache rows (masking already applied by the
/// caller), each `n_kv_heads * head_dim` wide. Query head `h` reads KV head
/// `h / (n_heads / n_kv_heads)`. An empty visible set yields zeros.
pub fn attention(
    q: &[f32],
    keys: &[&[f32]],
    values: &[&[f32]],
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
) -> Vec<f32> {
    let mut out = vec![0.0; n_heads * head_dim];
    if keys.is_empty() {
        return out;
    }
    let group = n_heads / n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    for h in 0..n_heads {
        let kv = h / group;
        let qh = &q[h * head_dim..(h + 1) * head_dim];
        let mut scores: Vec<f32> = keys
            .iter()
            .map(|k| {
                let kh = &k[kv * head_dim..(kv + 1) * head_dim];
                qh.iter().zip(kh).map(|(a, b)| a * b).sum::<f32>() * scale
            })
            .collect();
        softmax_in_place(&mut scores);

        let oh = &mut out[h * head_dim..(h + 1) * head_dim];
        for (w, v) in scores.iter().zip(values) {
            let vh = &v[kv * head_dim..(kv + 1) * head_dim];
            for (o, &x) in oh.iter_mut().zip(vh) {
                *o += w * x;
            }
        }
    }
    out
}

/// Transformer geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub d_model: usize,
    pub n_heads: usize,
    /// Fewer than `n_heads` for grouped-query attention
    pub n_kv_heads: usize,
    pub n_layers: usize,
    /// Feedforward hidden dimension
    pub d_ff: usize,
    pub vocab_size: usize,
    /// Context length the model was trained with
    pub max_seq_len: usize,
    pub rope_base: f32,
    pub norm_eps: f32,
}

impl ModelConfig {
    /// Small configuration for the CPU reference backend.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            d_model: 32,
            n_heads: 4,
            n_kv_heads: 2,
            n_layers: 2,
            d_ff: 64,
            vocab_size,
            max_seq_len: 4096,
            rope_base: 10000.0,
            norm_eps: 1e-5,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Width of one cached K or V row.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim()
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.n_heads == 0 || self.n_kv_heads == 0 || self.n_layers == 0 {
            return Err(ModelError::InvalidConfig(
                "heads and layers must be non-zero".to_string(),
            ));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "d_model {} not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "n_heads {} not divisible by n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ModelError::InvalidConfig(
                "head_dim must be even for RoPE".to_string(),
            ));
        }
        if self.vocab_size == 0 {
            return Err(ModelError::InvalidConfig("empty vocabulary".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmsnorm_scale_invariant() {
        let norm = RMSNorm::new(4, 1e-6);
        let a = norm.forward(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = norm.forward(&[2.0, 4.0, 6.0, 8.0]).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "RMSNorm should be scale-invariant");
        }
        // RMS of input: sqrt(7.5)
        assert!((a[0] - 1.0 / 7.5f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn rmsnorm_shape_mismatch() {
        let norm = RMSNorm::new(4, 1e-6);
        assert_eq!(
            norm.forward(&[1.0; 3]).unwrap_err(),
            ModelError::ShapeMismatch {
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn rope_inv_freq() {
        let rope = RoPE::new(64, 10000.0);
        assert_eq!(rope.inv_freq.len(), 32);
        assert!((rope.inv_freq[0] - 1.0).abs() < 1e-5);
        assert!(rope.inv_freq[31] < rope.inv_freq[0]);
    }

    #[test]
    fn rope_preserves_magnitude() {
        let rope = RoPE::new(8, 10000.0);
        let mut q = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let before: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        rope.rotate(&mut q, 17);
        let after: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((before - after).abs() < 1e-5, "Rotation should preserve magnitude");
    }

    #[test]
    fn rope_position_zero_is_identity() {
        let rope = RoPE::new(4, 10000.0);
        let mut x = vec![0.3, -0.2, 0.5, 0.1];
        let orig = x.clone();
        rope.rotate(&mut x, 0);
        assert_eq!(x, orig);
    }

    #[test]
    fn matvec_basic() {
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(matvec(&w, &[1.0, 0.0, -1.0], 2).unwrap(), vec![-2.0, -2.0]);
        assert!(matvec(&w, &[1.0, 0.0], 2).is_err());
    }

    #[test]
    fn swiglu_zero_gate() {
        assert_eq!(swiglu(&[0.0, 0.0], &[3.0, -1.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn attention_single_key_returns_value() {
        let q = vec![0.5; 4];
        let k = vec![1.0; 4];
        let v = vec![0.1, 0.2, 0.3, 0.4];
        let out = attention(&q, &[&k], &[&v], 2, 2, 2);
        assert_eq!(out, v);
    }

    #[test]
    fn attention_gqa_shares_kv_head() {
        let q = vec![1.0; 8]; // 4 heads x 2
        let k = vec![1.0; 4]; // 2 kv heads x 2
        let v = vec![1.0, 1.0, 2.0, 2.0];
        let out = attention(&q, &[&k], &[&v], 4, 2, 2);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn attention_without_keys_is_zero() {
        assert_eq!(attention(&[1.0; 4], &[], &[], 2, 1, 2), vec![0.0; 4]);
    }

    #[test]
    fn tiny_config_is_valid() {
        let cfg = ModelConfig::tiny(260);
        cfg.validate().unwrap();
        assert_eq!(cfg.head_dim(), 8);
        assert_eq!(cfg.kv_dim(), 16);
    }

    #[test]
    fn invalid_config_rejected() {
        let mut cfg = ModelConfig::tiny(260);
        cfg.n_kv_heads = 3;
        assert!(cfg.validate().is_err());
    }
}
