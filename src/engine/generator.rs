//! Batched generation loop.
//!
//! A [`Generator`] owns the model, the codec, the [`SequenceCache`] and the
//! sampler. Each call to [`Generator::generate`] runs one session over up to
//! `batch_size` prompts:
//!
//! ```text
//!            ┌──────────┐
//! prompts ──►│ Prefill  │  one padded forward pass, first token per slot
//!            └──────────┘
//!                 │
//!                 ▼
//!            ┌──────────┐
//!            │ Decode   │◄─┐  one token per active slot per step
//!            └──────────┘  │
//!                 │  active ┘
//!                 ▼
//!            ┌──────────┐
//!            │  Done    │  decode prompt + continuation per slot
//!            └──────────┘
//! ```
//!
//! Slot `i` of the session always uses cache region `i`. After the first
//! sampled token a slot's cache holds every token of its sequence except the
//! newest one, which is fed at the next step.

use std::collections::BTreeSet;

use candle_core::{IndexOp, Tensor};

use super::sampler::Sampler;
use crate::codec::TextCodec;
use crate::config::GenerationConfig;
use crate::core::kv_cache::SequenceCache;
use crate::core::sequence::{BatchSlot, StopReason};
use crate::error::{Error, Result};
use crate::model::{ForwardBatch, ForwardModel};

/// Result of one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Input prompt text.
    pub prompt: String,
    /// Decoded prompt followed by the continuation.
    pub text: String,
    /// Prompt token IDs after clamping to the cache capacity.
    pub prompt_token_ids: Vec<u32>,
    /// Generated token IDs, including a terminating EOS.
    pub output_token_ids: Vec<u32>,
    /// Number of generated tokens.
    pub emitted_count: usize,
    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,
}

/// Progress report passed to a streaming callback.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    /// 0 for prefill, then one per decode step.
    pub step: usize,
    /// Current decoded text of every slot.
    pub texts: Vec<String>,
    /// Whether each slot is still generating.
    pub active: Vec<bool>,
}

/// Batched text generator.
pub struct Generator<M: ForwardModel, C: TextCodec> {
    model: M,
    codec: C,
    config: GenerationConfig,
    cache: SequenceCache,
    sampler: Sampler,
    /// Trailing tokens decoded when looking for a stop string.
    stop_window: usize,
}

impl<M: ForwardModel, C: TextCodec> Generator<M, C> {
    /// Validates `config` against the model and allocates the cache.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid settings and
    /// [`Error::ResourceExhausted`] when the cache does not fit the memory limit.
    pub fn new(model: M, codec: C, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        if config.max_seq_len > model.max_sequence_len() {
            return Err(Error::Config(format!(
                "max_seq_len {} exceeds the model limit of {}",
                config.max_seq_len,
                model.max_sequence_len()
            )));
        }

        let vocab_size = model.vocab_size();
        let mut sampling = config.sampling.clone();
        let out_of_vocab: BTreeSet<u32> = sampling
            .disallowed_tokens
            .iter()
            .copied()
            .filter(|&t| t as usize >= vocab_size)
            .collect();
        if !out_of_vocab.is_empty() {
            tracing::warn!(?out_of_vocab, vocab_size, "ignoring disallowed tokens outside the vocabulary");
            sampling.disallowed_tokens.retain(|t| !out_of_vocab.contains(t));
        }
        if sampling.disallowed_tokens.len() >= vocab_size {
            return Err(Error::Config("every token id is disallowed".into()));
        }

        let cache = SequenceCache::allocate(
            model.cache_config(),
            model.device(),
            config.batch_size,
            config.max_seq_len,
            config.cache_memory_limit,
        )?;
        let sampler = match config.seed {
            Some(seed) => Sampler::with_seed(sampling, seed),
            None => Sampler::new(sampling),
        };

        // A token decodes to at least one character, and a match always ends
        // in the newest token.
        let stop_window = config
            .stop_strings
            .iter()
            .map(|stop| stop.chars().count())
            .max()
            .map_or(0, |longest| longest + 1);

        Ok(Self {
            model,
            codec,
            config,
            cache,
            sampler,
            stop_window,
        })
    }

    /// Get the session configuration.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Get the model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Get the codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Get the KV cache.
    pub fn cache(&self) -> &SequenceCache {
        &self.cache
    }

    /// Get mutable access to the KV cache.
    pub fn cache_mut(&mut self) -> &mut SequenceCache {
        &mut self.cache
    }

    /// Generates one continuation per prompt.
    ///
    /// Requires `1 <= prompts.len() <= batch_size`. Each returned string is the
    /// prompt followed by its continuation, in input order.
    pub fn generate<S: AsRef<str>>(&mut self, prompts: &[S]) -> Result<Vec<String>> {
        Ok(self
            .generate_outputs(prompts)?
            .into_iter()
            .map(|o| o.text)
            .collect())
    }

    /// Like [`generate`](Self::generate) but returns the full per-slot records.
    pub fn generate_outputs<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
    ) -> Result<Vec<GenerationOutput>> {
        self.run_session(prompts, None)
    }

    /// Runs a session, reporting progress after prefill and every decode step.
    pub fn generate_with_callback<S, F>(
        &mut self,
        prompts: &[S],
        mut callback: F,
    ) -> Result<Vec<GenerationOutput>>
    where
        S: AsRef<str>,
        F: FnMut(&StepUpdate),
    {
        self.run_session(prompts, Some(&mut callback))
    }

    /// Splits any number of prompts into `batch_size` chunks and runs one
    /// session per chunk.
    pub fn generate_chunked<S: AsRef<str>>(&mut self, prompts: &[S]) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(prompts.len());
        for chunk in prompts.chunks(self.config.batch_size) {
            outputs.extend(self.generate(chunk)?);
        }
        Ok(outputs)
    }

    fn run_session<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        mut callback: Option<&mut dyn FnMut(&StepUpdate)>,
    ) -> Result<Vec<GenerationOutput>> {
        let mut slots = self.prepare_slots(prompts)?;
        for slot in &slots {
            self.cache.reset(slot.index())?;
        }

        let prompt_lens: Vec<usize> = slots.iter().map(|s| s.sequence().prompt_len()).collect();
        tracing::info!(slots = slots.len(), ?prompt_lens, "starting generation session");

        let pad_id = self.codec.eos_token_id();
        let mut step = 0;

        if slots.iter().any(BatchSlot::is_active) {
            let prompt_ids: Vec<&[u32]> = slots
                .iter()
                .map(|s| s.sequence().prompt_token_ids())
                .collect();
            let batch = ForwardBatch::prefill(&prompt_ids, pad_id, self.model.device())?;
            let logits = self.model.forward(&batch, &mut self.cache)?;
            for slot in &slots {
                self.cache.advance(slot.index(), slot.sequence().prompt_len())?;
            }
            self.sample_step(&mut slots, &logits)?;
            self.report(&slots, step, &mut callback)?;
        }

        while slots.iter().any(BatchSlot::is_active) {
            step += 1;
            let steps = slots
                .iter()
                .map(|s| {
                    let token = if s.is_active() { s.sequence().last_token_id() } else { None };
                    Ok((self.cache.len(s.index())?, token))
                })
                .collect::<Result<Vec<_>>>()?;
            let batch = ForwardBatch::decode(&steps, pad_id, self.model.device())?;
            let logits = self.model.forward(&batch, &mut self.cache)?;
            for slot in slots.iter().filter(|s| s.is_active()) {
                self.cache.advance(slot.index(), 1)?;
            }
            self.sample_step(&mut slots, &logits)?;
            self.report(&slots, step, &mut callback)?;
        }

        let outputs = prompts
            .iter()
            .zip(&slots)
            .map(|(prompt, slot)| self.finish_slot(prompt.as_ref(), slot))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            steps = step,
            generated = outputs.iter().map(|o| o.emitted_count).sum::<usize>(),
            "generation session finished"
        );
        Ok(outputs)
    }

    /// Encodes, clamps and wraps each prompt in a slot.
    fn prepare_slots<S: AsRef<str>>(&self, prompts: &[S]) -> Result<Vec<BatchSlot>> {
        let batch_size = self.config.batch_size;
        if prompts.is_empty() || prompts.len() > batch_size {
            return Err(Error::BatchSize {
                prompts: prompts.len(),
                batch_size,
            });
        }

        let max_seq_len = self.config.max_seq_len;
        prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| {
                let mut ids = self.codec.encode(prompt.as_ref())?;
                if ids.is_empty() {
                    return Err(Error::EmptyPrompt(index));
                }
                if ids.len() > max_seq_len - 1 {
                    tracing::warn!(
                        slot = index,
                        prompt_len = ids.len(),
                        kept = max_seq_len - 1,
                        "prompt exceeds cache capacity, keeping its tail"
                    );
                    ids.drain(..ids.len() - (max_seq_len - 1));
                }

                let limit = self.config.max_new_tokens.min(max_seq_len - ids.len());
                let mut slot = BatchSlot::new(index, ids, limit);
                if limit == 0 {
                    slot.stop(StopReason::MaxTokens);
                }
                Ok(slot)
            })
            .collect()
    }

    /// Samples one token for every active slot and applies the stop rules.
    fn sample_step(&mut self, slots: &mut [BatchSlot], logits: &Tensor) -> Result<()> {
        let eos = self.codec.eos_token_id();
        for slot in slots.iter_mut().filter(|s| s.is_active()) {
            let row = logits.i(slot.index())?;
            let token = self.sampler.sample(&row, slot.sequence().all_token_ids())?;
            slot.push_token(token);

            let reason = if token == eos {
                Some(StopReason::EosToken)
            } else if slot.is_exhausted() {
                Some(StopReason::MaxTokens)
            } else if self.hits_stop_string(slot)? {
                Some(StopReason::StopString)
            } else {
                None
            };
            if let Some(reason) = reason {
                slot.stop(reason);
                tracing::debug!(
                    slot = slot.index(),
                    reason = reason.as_str(),
                    emitted = slot.state().emitted_count,
                    "slot stopped"
                );
            }
        }

        for slot in slots.iter() {
            debug_assert_eq!(
                self.cache.len(slot.index()).ok(),
                Some(slot.sequence().total_len() - 1),
                "cache of slot {} out of step with its sequence",
                slot.index()
            );
        }
        Ok(())
    }

    fn hits_stop_string(&self, slot: &BatchSlot) -> Result<bool> {
        if self.config.stop_strings.is_empty() {
            return Ok(false);
        }
        let output = slot.sequence().output_token_ids();
        let tail = &output[output.len().saturating_sub(self.stop_window)..];
        let text = self.codec.decode(tail)?;
        Ok(self
            .config
            .stop_strings
            .iter()
            .any(|stop| text.contains(stop.as_str())))
    }

    fn report(
        &self,
        slots: &[BatchSlot],
        step: usize,
        callback: &mut Option<&mut dyn FnMut(&StepUpdate)>,
    ) -> Result<()> {
        let Some(callback) = callback else {
            return Ok(());
        };
        let texts = slots
            .iter()
            .map(|s| self.codec.decode(self.final_tokens(s)))
            .collect::<Result<Vec<_>>>()?;
        (*callback)(&StepUpdate {
            step,
            texts,
            active: slots.iter().map(BatchSlot::is_active).collect(),
        });
        Ok(())
    }

    /// Prompt plus continuation, without a terminating EOS.
    fn final_tokens<'a>(&self, slot: &'a BatchSlot) -> &'a [u32] {
        let tokens = slot.sequence().all_token_ids();
        match slot.stop_reason() {
            Some(StopReason::EosToken) => &tokens[..tokens.len() - 1],
            _ => tokens,
        }
    }

    fn finish_slot(&self, prompt: &str, slot: &BatchSlot) -> Result<GenerationOutput> {
        Ok(GenerationOutput {
            prompt: prompt.to_string(),
            text: self.codec.decode(self.final_tokens(slot))?,
            prompt_token_ids: slot.sequence().prompt_token_ids().to_vec(),
            output_token_ids: slot.sequence().output_token_ids().to_vec(),
            emitted_count: slot.state().emitted_count,
            stop_reason: slot.stop_reason(),
        })
    }
}
