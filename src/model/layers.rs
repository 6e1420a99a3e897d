//! Building blocks shared by the Qwen3 layers: RMSNorm, RoPE and the SwiGLU MLP.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

/// Random linear layer `[out_dim, in_dim]` for tests.
pub(crate) fn random_linear(
    in_dim: usize,
    out_dim: usize,
    dtype: DType,
    device: &Device,
) -> Result<Linear> {
    let weight = Tensor::randn(0.0f32, 0.02, (out_dim, in_dim), device)?.to_dtype(dtype)?;
    Ok(Linear::new(weight, None))
}

/// Root-mean-square normalization over the last dimension.
///
/// `output = x / sqrt(mean(x^2) + eps) * weight`, computed in F32.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Creates a norm from a `[hidden_size]` weight.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Loads `weight` of shape `[size]` from a VarBuilder.
    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self::new(vb.get(size, "weight")?, eps))
    }

    /// Creates a norm with unit weights.
    pub fn new_ones(size: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self::new(Tensor::ones(size, dtype, device)?, eps))
    }

    /// Applies the normalization to `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let rms = (x.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        x.broadcast_div(&rms)?
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)
    }
}

/// Rotary position embedding with per-token positions.
///
/// Positions are looked up per input cell, so slots of one batch can sit at
/// different offsets in their cache regions.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine table `[max_seq_len, head_dim]`.
    cos: Tensor,
    /// Sine table `[max_seq_len, head_dim]`.
    sin: Tensor,
    head_dim: usize,
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Precomputes the tables for `max_seq_len` positions.
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if head_dim % 2 != 0 {
            candle_core::bail!("RoPE head dimension must be even, got {head_dim}");
        }
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [max_seq_len, half] duplicated to [max_seq_len, head_dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
            head_dim,
            max_seq_len,
        })
    }

    /// Number of positions in the tables.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Rotates `x` of shape `[batch, seq_len, heads, head_dim]` by `positions`
    /// of shape `[batch, seq_len]` (u32).
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = positions.dims2()?;
        let flat = positions.flatten_all()?;
        let cos = self
            .cos
            .index_select(&flat, 0)?
            .reshape((batch, seq_len, 1, self.head_dim))?;
        let sin = self
            .sin
            .index_select(&flat, 0)?
            .reshape((batch, seq_len, 1, self.head_dim))?;

        let half = self.head_dim / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

/// SwiGLU feed-forward block: `down(silu(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct Qwen3Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Qwen3Mlp {
    /// Loads the three projections from a VarBuilder.
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    /// Creates the block with random weights for testing.
    pub fn new_random(
        hidden_size: usize,
        intermediate_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            gate_proj: random_linear(hidden_size, intermediate_size, dtype, device)?,
            up_proj: random_linear(hidden_size, intermediate_size, dtype, device)?,
            down_proj: random_linear(intermediate_size, hidden_size, dtype, device)?,
        })
    }
}

impl Module for Qwen3Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_unit_rms() {
        let device = Device::Cpu;
        let norm = RmsNorm::new_ones(4, 1e-6, DType::F32, &device).unwrap();
        let x = Tensor::new(&[[2.0f32, -2.0, 2.0, -2.0]], &device).unwrap();

        let y: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        for v in &y[0] {
            assert!((v.abs() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(4, 16, 10_000.0, DType::F32, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 2, 4), &device).unwrap();
        let positions = Tensor::new(&[[0u32]], &device).unwrap();

        let y = rope.apply(&x, &positions).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_rope_uses_per_row_positions() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(4, 16, 10_000.0, DType::F32, &device).unwrap();
        let row = Tensor::randn(0.0f32, 1.0, (1, 1, 1, 4), &device).unwrap();
        let x = Tensor::cat(&[&row, &row], 0).unwrap();
        let positions = Tensor::new(&[[3u32], [3u32]], &device).unwrap();
        let shifted = Tensor::new(&[[3u32], [5u32]], &device).unwrap();

        let same: Vec<f32> = rope.apply(&x, &positions).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let diff: Vec<f32> = rope.apply(&x, &shifted).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(same[..4], same[4..]);
        assert_ne!(diff[..4], diff[4..]);
    }

    #[test]
    fn test_mlp_shape() {
        let device = Device::Cpu;
        let mlp = Qwen3Mlp::new_random(8, 16, DType::F32, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 8), &device).unwrap();

        assert_eq!(mlp.forward(&x).unwrap().dims(), &[2, 3, 8]);
    }
}
