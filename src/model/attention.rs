//! Qwen3 grouped-query attention over a shared [`SequenceCache`].
//!
//! Each layer writes the new keys/values of every slot straight into that
//! slot's cache region, then attends over the stacked regions of the whole
//! batch. The mask built by [`ForwardBatch::attention_mask`] hides padding,
//! stale positions and other slots' lengths.

use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::layers::{random_linear, RmsNorm, RotaryEmbedding};
use super::loader::Qwen3Config;
use super::ForwardBatch;
use crate::core::kv_cache::SequenceCache;
use crate::error::Result;

/// Qwen3 attention with per-head Q/K normalization and RoPE.
#[derive(Debug, Clone)]
pub struct Qwen3Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Qwen3Attention {
    /// Loads the attention block of one decoder layer.
    pub fn new(config: &Qwen3Config, rotary_emb: RotaryEmbedding, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_key_value_heads * config.head_dim;

        Ok(Self {
            q_proj: linear_no_bias(hidden, q_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden, kv_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden, kv_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(q_dim, hidden, vb.pp("o_proj"))?,
            q_norm: RmsNorm::load(config.head_dim, config.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: RmsNorm::load(config.head_dim, config.rms_norm_eps, vb.pp("k_norm"))?,
            rotary_emb,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim,
            scale: 1.0 / (config.head_dim as f64).sqrt(),
        })
    }

    /// Creates an attention block with random weights for testing.
    pub fn new_random(
        config: &Qwen3Config,
        rotary_emb: RotaryEmbedding,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_key_value_heads * config.head_dim;
        let eps = config.rms_norm_eps;

        Ok(Self {
            q_proj: random_linear(hidden, q_dim, dtype, device)?,
            k_proj: random_linear(hidden, kv_dim, dtype, device)?,
            v_proj: random_linear(hidden, kv_dim, dtype, device)?,
            o_proj: random_linear(q_dim, hidden, dtype, device)?,
            q_norm: RmsNorm::new_ones(config.head_dim, eps, dtype, device)?,
            k_norm: RmsNorm::new_ones(config.head_dim, eps, dtype, device)?,
            rotary_emb,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim,
            scale: 1.0 / (config.head_dim as f64).sqrt(),
        })
    }

    /// Returns the number of query heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Returns the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Returns the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Forward pass for one layer.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - `[batch, seq_len, hidden_size]`
    /// * `layer` - Layer index into the cache
    /// * `batch` - Slot layout of this pass
    /// * `positions` - `[batch, seq_len]` absolute positions
    /// * `mask` - `[batch, 1, seq_len, kv_len]` additive mask
    /// * `cache` - Cache receiving this pass's keys and values
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        layer: usize,
        batch: &ForwardBatch,
        positions: &Tensor,
        mask: &Tensor,
        cache: &mut SequenceCache,
    ) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self
            .q_proj
            .forward(hidden_states)?
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?;
        let k = self
            .k_proj
            .forward(hidden_states)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = self
            .v_proj
            .forward(hidden_states)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?;

        let q = self.rotary_emb.apply(&self.q_norm.forward(&q)?, positions)?;
        let k = self.rotary_emb.apply(&self.k_norm.forward(&k)?, positions)?;

        // Padding cells are never written.
        for slot in 0..batch_size {
            let count = batch.token_count(slot);
            if count == 0 {
                continue;
            }
            cache.write(
                slot,
                layer,
                batch.start_position(slot),
                &k.i(slot)?.narrow(0, 0, count)?,
                &v.i(slot)?.narrow(0, 0, count)?,
            )?;
        }

        let kv_len = batch.kv_len();
        let (k, v) = cache.gather(layer, batch_size, kv_len)?;
        let dtype = q.dtype();
        let k = self.repeat_kv(&k.to_dtype(dtype)?)?;
        let v = self.repeat_kv(&v.to_dtype(dtype)?)?;

        // [batch, heads, seq, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let output = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;

        Ok(self.o_proj.forward(&output)?)
    }

    /// `[batch, len, num_kv_heads, head_dim]` to `[batch, len, num_heads, head_dim]`.
    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }
        let (batch, len, kv_heads, head_dim) = x.dims4()?;
        Ok(x.unsqueeze(3)?
            .expand((batch, len, kv_heads, n_rep, head_dim))?
            .reshape((batch, len, self.num_heads, head_dim))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv_cache::CacheConfig;

    fn setup(batch_size: usize) -> (Qwen3Attention, SequenceCache, Qwen3Config) {
        let device = Device::Cpu;
        let config = Qwen3Config::tiny(16);
        let rope = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            DType::F32,
            &device,
        )
        .unwrap();
        let attn = Qwen3Attention::new_random(&config, rope, DType::F32, &device).unwrap();
        let cache = SequenceCache::allocate(
            CacheConfig::new(1, config.num_key_value_heads, config.head_dim),
            &device,
            batch_size,
            16,
            None,
        )
        .unwrap();
        (attn, cache, config)
    }

    #[test]
    fn test_forward_shape() {
        let (attn, mut cache, config) = setup(2);
        let batch = ForwardBatch::prefill(&[&[1, 2, 3], &[4, 5]], 0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 0.1, (2, 3, config.hidden_size), &Device::Cpu).unwrap();

        let out = attn
            .forward(
                &x,
                0,
                &batch,
                &batch.position_ids().unwrap(),
                &batch.attention_mask(batch.kv_len(), DType::F32).unwrap(),
                &mut cache,
            )
            .unwrap();

        assert_eq!(out.dims(), &[2, 3, config.hidden_size]);
        assert_eq!(attn.num_heads(), 4);
        assert_eq!(attn.num_kv_heads(), 2);
    }

    #[test]
    fn test_padding_not_written() {
        let (attn, mut cache, config) = setup(2);
        let batch = ForwardBatch::prefill(&[&[1, 2, 3], &[4]], 0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 3, config.hidden_size), &Device::Cpu).unwrap();

        attn.forward(
            &x,
            0,
            &batch,
            &batch.position_ids().unwrap(),
            &batch.attention_mask(batch.kv_len(), DType::F32).unwrap(),
            &mut cache,
        )
        .unwrap();

        // Lengths are the caller's business.
        assert_eq!(cache.len(1).unwrap(), 0);

        let (keys, _) = cache.read(1, 0, 3).unwrap();
        let rows: Vec<Vec<f32>> = keys
            .reshape((3, config.num_key_value_heads * config.head_dim))
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(rows[0].iter().any(|&x| x != 0.0));
        assert!(rows[1].iter().all(|&x| x == 0.0));
        assert!(rows[2].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_repeat_kv() {
        let (attn, _, _) = setup(1);
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 2, 8), &Device::Cpu).unwrap();

        assert_eq!(attn.repeat_kv(&x).unwrap().dims(), &[1, 4, 4, 8]);
    }
}
