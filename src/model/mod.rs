//! Forward model interface and the bundled Qwen3 implementation.
//!
//! The generator only talks to models through [`ForwardModel`]. One call
//! processes a [`ForwardBatch`]: a right-padded block of token ids together
//! with, per slot, the cache position the block starts at and how many of its
//! tokens are real.
//!
//! ## Padding and masking
//!
//! ```text
//! slot 0: start 0, count 4   [t t t t]      keys written: 0..4
//! slot 1: start 0, count 2   [t t p p]      keys written: 0..2
//! slot 2: start 5, count 0   [p p p p]      nothing written (inactive)
//! ```
//!
//! Query `i` of slot `s` may attend key `j` iff `j < start_s + count_s` and
//! `j <= start_s + i`. Padding never reaches the cache and never receives
//! attention, so every slot sees exactly its own history at its own positions.

pub mod attention;
pub mod layers;
pub mod loader;
pub mod qwen3;

use candle_core::{DType, Device, Tensor};

use crate::core::kv_cache::{CacheConfig, SequenceCache};
use crate::error::{Error, Result};

pub use attention::Qwen3Attention;
pub use layers::{Qwen3Mlp, RmsNorm, RotaryEmbedding};
pub use loader::{download_model, load_config, load_local, load_safetensors, ModelFiles, Qwen3Config};
pub use qwen3::{Qwen3DecoderLayer, Qwen3ForCausalLM, Qwen3Model};

/// A model that scores the next token for every slot of a batch.
pub trait ForwardModel {
    /// Cache shape this model needs.
    fn cache_config(&self) -> CacheConfig;

    /// Device the model runs on.
    fn device(&self) -> &Device;

    /// Vocabulary size, i.e. the width of each logit row.
    fn vocab_size(&self) -> usize;

    /// Longest sequence the model can position.
    fn max_sequence_len(&self) -> usize;

    /// Runs one batched forward pass.
    ///
    /// Writes keys/values of every real token into `cache` at
    /// `batch.start_position(s)..batch.valid_end(s)` for each slot `s`, but does
    /// not advance region lengths; the caller does that after the call.
    ///
    /// # Returns
    ///
    /// Logits `[batch, vocab_size]` taken at each slot's last real token.
    fn forward(&mut self, batch: &ForwardBatch, cache: &mut SequenceCache) -> Result<Tensor>;
}

/// One batched model input.
#[derive(Debug, Clone)]
pub struct ForwardBatch {
    /// Token ids `[batch, seq_len]`, right-padded.
    input_ids: Tensor,
    /// Real tokens per slot.
    tokens: Vec<Vec<u32>>,
    /// Cache position of each slot's first token.
    start_positions: Vec<usize>,
    /// Padded row width.
    seq_len: usize,
}

impl ForwardBatch {
    /// Builds a batch from per-slot `(start_position, tokens)` rows.
    ///
    /// A row with no tokens keeps its place in the batch but is skipped by the
    /// model. At least one row must carry tokens.
    pub fn new(rows: Vec<(usize, Vec<u32>)>, pad_id: u32, device: &Device) -> Result<Self> {
        let seq_len = rows.iter().map(|(_, t)| t.len()).max().unwrap_or(0);
        if seq_len == 0 {
            return Err(Error::Config("forward batch has no tokens".into()));
        }

        let mut ids = Vec::with_capacity(rows.len() * seq_len);
        for (_, tokens) in &rows {
            ids.extend_from_slice(tokens);
            ids.extend(std::iter::repeat(pad_id).take(seq_len - tokens.len()));
        }
        let input_ids = Tensor::from_vec(ids, (rows.len(), seq_len), device)?;
        let (start_positions, tokens) = rows.into_iter().unzip();

        Ok(Self {
            input_ids,
            tokens,
            start_positions,
            seq_len,
        })
    }

    /// Prefill batch: every prompt starts at cache position 0.
    pub fn prefill(prompts: &[&[u32]], pad_id: u32, device: &Device) -> Result<Self> {
        let rows = prompts.iter().map(|p| (0, p.to_vec())).collect();
        Self::new(rows, pad_id, device)
    }

    /// Decode batch: one token per active slot, nothing for inactive ones.
    pub fn decode(steps: &[(usize, Option<u32>)], pad_id: u32, device: &Device) -> Result<Self> {
        let rows = steps
            .iter()
            .map(|&(start, token)| (start, token.into_iter().collect()))
            .collect();
        Self::new(rows, pad_id, device)
    }

    /// Token ids `[batch, seq_len]`.
    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    /// Number of slots.
    pub fn batch_size(&self) -> usize {
        self.tokens.len()
    }

    /// Padded row width.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Real tokens of a slot.
    pub fn tokens(&self, slot: usize) -> &[u32] {
        &self.tokens[slot]
    }

    /// Number of real tokens of a slot.
    pub fn token_count(&self, slot: usize) -> usize {
        self.tokens[slot].len()
    }

    /// Cache position of a slot's first token.
    pub fn start_position(&self, slot: usize) -> usize {
        self.start_positions[slot]
    }

    /// One past the last valid cache position of a slot after this pass.
    pub fn valid_end(&self, slot: usize) -> usize {
        self.start_positions[slot] + self.token_count(slot)
    }

    /// Key length the model must attend over.
    pub fn kv_len(&self) -> usize {
        (0..self.batch_size())
            .map(|s| self.valid_end(s))
            .max()
            .unwrap_or(0)
    }

    /// Row index of each slot's last real token (0 for skipped slots).
    pub fn last_indices(&self) -> Vec<usize> {
        self.tokens
            .iter()
            .map(|t| t.len().saturating_sub(1))
            .collect()
    }

    /// Absolute position of every input cell `[batch, seq_len]`.
    ///
    /// Padding cells repeat the slot's last real position so they stay inside
    /// the position table.
    pub fn position_ids(&self) -> Result<Tensor> {
        let mut positions = Vec::with_capacity(self.batch_size() * self.seq_len);
        for slot in 0..self.batch_size() {
            let start = self.start_positions[slot];
            let last = self.token_count(slot).saturating_sub(1);
            positions.extend((0..self.seq_len).map(|i| (start + i.min(last)) as u32));
        }
        Ok(Tensor::from_vec(
            positions,
            (self.batch_size(), self.seq_len),
            self.input_ids.device(),
        )?)
    }

    /// Additive attention mask `[batch, 1, seq_len, kv_len]`: 0 where allowed,
    /// negative infinity elsewhere.
    pub fn attention_mask(&self, kv_len: usize, dtype: DType) -> Result<Tensor> {
        let mut mask = Vec::with_capacity(self.batch_size() * self.seq_len * kv_len);
        for slot in 0..self.batch_size() {
            let start = self.start_positions[slot];
            let end = self.valid_end(slot);
            for i in 0..self.seq_len {
                mask.extend((0..kv_len).map(|j| {
                    if j < end && j <= start + i {
                        0.0f32
                    } else {
                        f32::NEG_INFINITY
                    }
                }));
            }
        }
        let mask = Tensor::from_vec(
            mask,
            (self.batch_size(), 1, self.seq_len, kv_len),
            self.input_ids.device(),
        )?;
        Ok(mask.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefill_pads_right() {
        let batch = ForwardBatch::prefill(&[&[5, 6, 7], &[8]], 0, &Device::Cpu).unwrap();

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 3);
        let ids: Vec<Vec<u32>> = batch.input_ids().to_vec2().unwrap();
        assert_eq!(ids, vec![vec![5, 6, 7], vec![8, 0, 0]]);
        assert_eq!(batch.last_indices(), vec![2, 0]);
        assert_eq!(batch.kv_len(), 3);
    }

    #[test]
    fn test_decode_skips_inactive() {
        let batch =
            ForwardBatch::decode(&[(4, Some(9)), (6, None)], 0, &Device::Cpu).unwrap();

        assert_eq!(batch.seq_len(), 1);
        assert_eq!(batch.token_count(1), 0);
        assert_eq!(batch.valid_end(0), 5);
        assert_eq!(batch.valid_end(1), 6);
        assert_eq!(batch.kv_len(), 6);

        let positions: Vec<Vec<u32>> = batch.position_ids().unwrap().to_vec2().unwrap();
        assert_eq!(positions, vec![vec![4], vec![6]]);
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(ForwardBatch::decode(&[(3, None)], 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_attention_mask_hides_padding() {
        let batch = ForwardBatch::prefill(&[&[1, 2, 3], &[4]], 0, &Device::Cpu).unwrap();
        let mask = batch.attention_mask(3, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 3, 3]);

        let inf = f32::NEG_INFINITY;
        let slot0: Vec<Vec<f32>> = mask.get(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(
            slot0,
            vec![vec![0.0, inf, inf], vec![0.0, 0.0, inf], vec![0.0, 0.0, 0.0]]
        );

        // Only key 0 is real for the short prompt, whatever the query row.
        let slot1: Vec<Vec<f32>> = mask.get(1).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(slot1, vec![vec![0.0, inf, inf]; 3]);
    }

    #[test]
    fn test_decode_mask_covers_history() {
        let batch =
            ForwardBatch::decode(&[(2, Some(1)), (2, None)], 0, &Device::Cpu).unwrap();
        assert_eq!(batch.kv_len(), 3);

        let mask = batch.attention_mask(batch.kv_len(), DType::F32).unwrap();
        let rows: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        let inf = f32::NEG_INFINITY;

        // The active slot sees its history plus the new token; the inactive
        // slot only sees what is already cached.
        assert_eq!(rows, vec![0.0, 0.0, 0.0, 0.0, 0.0, inf]);
    }
}
