//! Deterministic test doubles for the generation engine.

#![allow(dead_code)]

use std::cell::RefCell;

use candle_core::{DType, Device, Tensor};
use nano_batchgen::core::kv_cache::{CacheConfig, SequenceCache};
use nano_batchgen::{ForwardBatch, ForwardModel, Result, TextCodec};

/// End-of-sequence id of [`ByteCodec`].
pub const EOS: u32 = 256;

/// Vocabulary size of [`ByteCodec`]: every byte plus EOS.
pub const VOCAB: usize = 257;

/// Maps each UTF-8 byte to its own token id.
pub struct ByteCodec;

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id < EOS)
            .map(|&id| id as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// [`ByteCodec`] that records the length of every decode call.
#[derive(Default)]
pub struct RecordingCodec {
    pub decoded_lens: RefCell<Vec<usize>>,
}

impl TextCodec for RecordingCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        ByteCodec.encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.decoded_lens.borrow_mut().push(ids.len());
        ByteCodec.decode(ids)
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// Logits strongly favouring one token.
pub fn one_hot(token: u32) -> Vec<f32> {
    let mut logits = vec![0.0; VOCAB];
    logits[token as usize] = 10.0;
    logits
}

/// Rule that predicts the byte after the last one.
pub fn next_byte(history: &[u32]) -> Vec<f32> {
    let last = history.last().copied().unwrap_or(0);
    one_hot((last + 1) % EOS)
}

type Rule = Box<dyn Fn(&[u32]) -> Vec<f32>>;

/// Model whose logits are a function of the history stored in its cache.
///
/// Each token id is written into the cache as a one-element key, and every
/// forward pass reads a slot's history back from the cache. Anything the
/// engine gets wrong about cache positions therefore shows up in the output.
pub struct ScriptedModel {
    rule: Rule,
    device: Device,
    max_sequence_len: usize,
    /// Per forward call, the history each slot saw.
    pub calls: Vec<Vec<Vec<u32>>>,
}

impl ScriptedModel {
    pub fn new(rule: impl Fn(&[u32]) -> Vec<f32> + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            device: Device::Cpu,
            max_sequence_len: 512,
            calls: Vec::new(),
        }
    }

    pub fn next_byte() -> Self {
        Self::new(next_byte)
    }
}

impl ForwardModel for ScriptedModel {
    fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(1, 1, 1)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn max_sequence_len(&self) -> usize {
        self.max_sequence_len
    }

    fn forward(&mut self, batch: &ForwardBatch, cache: &mut SequenceCache) -> Result<Tensor> {
        let mut rows = Vec::with_capacity(batch.batch_size() * VOCAB);
        let mut histories = Vec::with_capacity(batch.batch_size());

        for slot in 0..batch.batch_size() {
            let tokens = batch.tokens(slot);
            if !tokens.is_empty() {
                let keys: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
                let keys = Tensor::from_vec(keys, (tokens.len(), 1, 1), &self.device)?;
                cache.write(slot, 0, batch.start_position(slot), &keys, &keys)?;
            }

            let end = batch.valid_end(slot);
            let history: Vec<u32> = if end == 0 {
                Vec::new()
            } else {
                let (keys, _) = cache.read(slot, 0, end)?;
                keys.to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .into_iter()
                    .map(|k| k as u32)
                    .collect()
            };
            rows.extend((self.rule)(&history));
            histories.push(history);
        }

        self.calls.push(histories);
        Ok(Tensor::from_vec(rows, (batch.batch_size(), VOCAB), &self.device)?)
    }
}
