//! Qwen3 transformer implementing [`ForwardModel`].
//!
//! ## Architecture
//!
//! ```text
//! Input Token IDs [batch, seq_len]
//!       │
//!       ▼
//! ┌───────────────┐
//! │  Embedding    │  vocab_size → hidden_size
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │ DecoderLayer  │ × num_hidden_layers   (writes K/V into SequenceCache)
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │   RMSNorm     │
//! └───────────────┘
//!       │  last real token of each slot
//!       ▼
//! ┌───────────────┐
//! │   LM Head     │  hidden_size → vocab_size
//! └───────────────┘
//!       │
//!       ▼
//! Logits [batch, vocab_size]
//! ```

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};

use super::attention::Qwen3Attention;
use super::layers::{random_linear, Qwen3Mlp, RmsNorm, RotaryEmbedding};
use super::loader::Qwen3Config;
use super::{ForwardBatch, ForwardModel};
use crate::core::kv_cache::{CacheConfig, SequenceCache};
use crate::error::Result;

/// Pre-norm decoder layer: attention and MLP, each with a residual.
#[derive(Debug, Clone)]
pub struct Qwen3DecoderLayer {
    self_attn: Qwen3Attention,
    mlp: Qwen3Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl Qwen3DecoderLayer {
    /// Loads one decoder layer.
    pub fn new(config: &Qwen3Config, rotary_emb: RotaryEmbedding, vb: VarBuilder) -> Result<Self> {
        let eps = config.rms_norm_eps;
        Ok(Self {
            self_attn: Qwen3Attention::new(config, rotary_emb, vb.pp("self_attn"))?,
            mlp: Qwen3Mlp::new(config.hidden_size, config.intermediate_size, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::load(config.hidden_size, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::load(
                config.hidden_size,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    /// Creates a layer with random weights for testing.
    pub fn new_random(
        config: &Qwen3Config,
        rotary_emb: RotaryEmbedding,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let eps = config.rms_norm_eps;
        Ok(Self {
            self_attn: Qwen3Attention::new_random(config, rotary_emb, dtype, device)?,
            mlp: Qwen3Mlp::new_random(config.hidden_size, config.intermediate_size, dtype, device)?,
            input_layernorm: RmsNorm::new_ones(config.hidden_size, eps, dtype, device)?,
            post_attention_layernorm: RmsNorm::new_ones(config.hidden_size, eps, dtype, device)?,
        })
    }

    /// Runs the layer, writing its keys/values to `cache` under index `layer`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        layer: usize,
        batch: &ForwardBatch,
        positions: &Tensor,
        mask: &Tensor,
        cache: &mut SequenceCache,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn = self
            .self_attn
            .forward(&normed, layer, batch, positions, mask, cache)?;
        let hidden_states = (hidden_states + attn)?;

        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp = self.mlp.forward(&normed)?;
        Ok((hidden_states + mlp)?)
    }
}

/// Qwen3 transformer body: embedding, decoder stack and final norm.
#[derive(Debug, Clone)]
pub struct Qwen3Model {
    embed_tokens: Embedding,
    layers: Vec<Qwen3DecoderLayer>,
    norm: RmsNorm,
    device: Device,
    dtype: DType,
}

impl Qwen3Model {
    /// Loads the model body from a VarBuilder.
    pub fn new(config: &Qwen3Config, vb: VarBuilder) -> Result<Self> {
        let rotary_emb = rotary_for(config, vb.dtype(), vb.device())?;
        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("model.embed_tokens"),
        )?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                Qwen3DecoderLayer::new(config, rotary_emb.clone(), vb.pp(format!("model.layers.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Creates a model body with random weights for testing.
    pub fn new_random(config: &Qwen3Config, dtype: DType, device: &Device) -> Result<Self> {
        let rotary_emb = rotary_for(config, dtype, device)?;
        let weights = Tensor::randn(0.0f32, 0.02, (config.vocab_size, config.hidden_size), device)?
            .to_dtype(dtype)?;
        let layers = (0..config.num_hidden_layers)
            .map(|_| Qwen3DecoderLayer::new_random(config, rotary_emb.clone(), dtype, device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embed_tokens: Embedding::new(weights, config.hidden_size),
            layers,
            norm: RmsNorm::new_ones(config.hidden_size, config.rms_norm_eps, dtype, device)?,
            device: device.clone(),
            dtype,
        })
    }

    /// Hidden states `[batch, seq_len, hidden_size]` after the final norm.
    pub fn forward(&self, batch: &ForwardBatch, cache: &mut SequenceCache) -> Result<Tensor> {
        let positions = batch.position_ids()?;
        let mask = batch.attention_mask(batch.kv_len(), self.dtype)?;

        let mut hidden_states = self.embed_tokens.forward(batch.input_ids())?;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden_states = layer.forward(&hidden_states, i, batch, &positions, &mask, cache)?;
        }
        Ok(self.norm.forward(&hidden_states)?)
    }

    /// Returns the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Returns the embedding layer for weight tying.
    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }
}

fn rotary_for(config: &Qwen3Config, dtype: DType, device: &Device) -> Result<RotaryEmbedding> {
    Ok(RotaryEmbedding::new(
        config.head_dim,
        config.max_position_embeddings,
        config.rope_theta,
        dtype,
        device,
    )?)
}

/// Qwen3 with its language-model head.
#[derive(Debug, Clone)]
pub struct Qwen3ForCausalLM {
    model: Qwen3Model,
    lm_head: Linear,
    config: Qwen3Config,
}

impl Qwen3ForCausalLM {
    /// Loads the model from a VarBuilder.
    pub fn new(config: &Qwen3Config, vb: VarBuilder) -> Result<Self> {
        tracing::info!(
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            vocab = config.vocab_size,
            dtype = ?vb.dtype(),
            "loading Qwen3 weights"
        );
        let model = Qwen3Model::new(config, vb.clone())?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(model.embed_tokens().embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            model,
            lm_head,
            config: config.clone(),
        })
    }

    /// Creates a model with random weights for testing.
    pub fn new_random(config: &Qwen3Config, dtype: DType, device: &Device) -> Result<Self> {
        let model = Qwen3Model::new_random(config, dtype, device)?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(model.embed_tokens().embeddings().clone(), None)
        } else {
            random_linear(config.hidden_size, config.vocab_size, dtype, device)?
        };

        Ok(Self {
            model,
            lm_head,
            config: config.clone(),
        })
    }

    /// Returns reference to the base model.
    pub fn model(&self) -> &Qwen3Model {
        &self.model
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &Qwen3Config {
        &self.config
    }

    /// Returns the data type.
    pub fn dtype(&self) -> DType {
        self.model.dtype
    }
}

impl ForwardModel for Qwen3ForCausalLM {
    fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(
            self.config.num_hidden_layers,
            self.config.num_key_value_heads,
            self.config.head_dim,
        )
        .with_dtype(self.model.dtype)
    }

    fn device(&self) -> &Device {
        &self.model.device
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_sequence_len(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn forward(&mut self, batch: &ForwardBatch, cache: &mut SequenceCache) -> Result<Tensor> {
        let hidden_states = self.model.forward(batch, cache)?;
        let last = batch
            .last_indices()
            .into_iter()
            .enumerate()
            .map(|(slot, idx)| hidden_states.i((slot, idx)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let last = Tensor::stack(&last, 0)?;

        Ok(self.lm_head.forward(&last)?.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_returns_one_row_per_slot() {
        let device = Device::Cpu;
        let config = Qwen3Config::tiny(20);
        let mut model = Qwen3ForCausalLM::new_random(&config, DType::F32, &device).unwrap();
        let mut cache =
            SequenceCache::allocate(model.cache_config(), &device, 3, 16, None).unwrap();

        let batch = ForwardBatch::prefill(&[&[1, 2, 3], &[4], &[5, 6]], 0, &device).unwrap();
        let logits = model.forward(&batch, &mut cache).unwrap();

        assert_eq!(logits.dims(), &[3, 20]);
        assert_eq!(logits.dtype(), DType::F32);
        assert_eq!(model.model().num_layers(), 2);
    }

    #[test]
    fn test_cache_config_matches_model() {
        let config = Qwen3Config::tiny(20);
        let model = Qwen3ForCausalLM::new_random(&config, DType::F32, &Device::Cpu).unwrap();
        let cache_config = model.cache_config();

        assert_eq!(cache_config.num_layers, 2);
        assert_eq!(cache_config.num_kv_heads, 2);
        assert_eq!(cache_config.head_dim, 8);
        assert_eq!(model.max_sequence_len(), 256);
    }
}
