//! Configuration types for nano-batchgen.
//!
//! Both structs are plain data with serde support so they can be loaded from a
//! JSON file. They are validated once when a [`Generator`](crate::Generator) is
//! built and are never mutated by the engine afterwards.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sampling configuration shared read-only by every slot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// Temperature for scaling logits (0.0 = greedy arg-max).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (0.0 or 1.0 = disabled).
    pub top_p: f32,
    /// Minimum renormalized probability kept during the top-p walk (0.0 = disabled).
    pub min_p: f32,
    /// Locally typical sampling mass (0.0 or 1.0 = disabled).
    pub typical: f32,
    /// Penalty applied to the most recent repeated tokens (1.0 = disabled).
    pub token_repetition_penalty_max: f32,
    /// Number of most recent positions that carry the full penalty.
    pub token_repetition_penalty_sustain: usize,
    /// Number of positions after the sustain window over which the penalty fades to 1.0.
    pub token_repetition_penalty_decay: usize,
    /// Token ids that can never be sampled.
    pub disallowed_tokens: BTreeSet<u32>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: 0.95,
            top_k: 40,
            top_p: 0.65,
            min_p: 0.0,
            typical: 0.0,
            token_repetition_penalty_max: 1.15,
            token_repetition_penalty_sustain: 256,
            token_repetition_penalty_decay: 128,
            disallowed_tokens: BTreeSet::new(),
        }
    }
}

impl SamplingSettings {
    /// Settings for deterministic arg-max decoding with no penalty.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 0.0,
            min_p: 0.0,
            typical: 0.0,
            token_repetition_penalty_max: 1.0,
            ..Default::default()
        }
    }

    /// Adds token ids that must never be sampled.
    pub fn disallow_tokens(mut self, tokens: impl IntoIterator<Item = u32>) -> Self {
        self.disallowed_tokens.extend(tokens);
        self
    }

    /// Whether sampling degenerates to arg-max.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Checks every parameter against its valid range.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        check_unit_range("top_p", self.top_p)?;
        check_unit_range("min_p", self.min_p)?;
        check_unit_range("typical", self.typical)?;
        if !self.token_repetition_penalty_max.is_finite() || self.token_repetition_penalty_max < 1.0
        {
            return Err(Error::Config(format!(
                "token_repetition_penalty_max must be finite and >= 1, got {}",
                self.token_repetition_penalty_max
            )));
        }
        Ok(())
    }
}

fn check_unit_range(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be in [0, 1], got {value}")))
    }
}

/// Session-level generation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of cache slots, i.e. the largest number of prompts per session.
    pub batch_size: usize,
    /// Maximum number of tokens to generate per prompt.
    pub max_new_tokens: usize,
    /// Cache capacity per slot (prompt + generated tokens).
    pub max_seq_len: usize,
    /// Stop strings matched against each slot's decoded continuation.
    pub stop_strings: Vec<String>,
    /// Seed for the sampling RNG (None = seeded from entropy).
    pub seed: Option<u64>,
    /// Upper bound on KV cache memory in bytes (None = unbounded).
    pub cache_memory_limit: Option<usize>,
    /// Sampling parameters.
    pub sampling: SamplingSettings,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_new_tokens: 128,
            max_seq_len: 2048,
            stop_strings: Vec::new(),
            seed: None,
            cache_memory_limit: None,
            sampling: SamplingSettings::default(),
        }
    }
}

impl GenerationConfig {
    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the maximum number of new tokens.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the per-slot cache capacity.
    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Set the sampling parameters.
    pub fn sampling(mut self, sampling: SamplingSettings) -> Self {
        self.sampling = sampling;
        self
    }

    /// Add a stop string.
    pub fn stop_string(mut self, stop: impl Into<String>) -> Self {
        self.stop_strings.push(stop.into());
        self
    }

    /// Set the RNG seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validates the session parameters and the nested sampling settings.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.max_seq_len < 2 {
            return Err(Error::Config(format!(
                "max_seq_len must be at least 2, got {}",
                self.max_seq_len
            )));
        }
        if self.stop_strings.iter().any(String::is_empty) {
            return Err(Error::Config("stop strings must not be empty".into()));
        }
        self.sampling.validate()
    }
}
