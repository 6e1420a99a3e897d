//! nano-batchgen: batched autoregressive text generation in Rust.
//!
//! A [`Generator`] takes a list of prompts, runs them through a
//! [`ForwardModel`] as one padded batch, and decodes every slot token by token
//! against a preallocated per-slot [`SequenceCache`]:
//! - Prefill of mixed-length prompts in a single masked forward pass
//! - One batched decode step per token for all active slots
//! - Repetition penalty, temperature, top-k, top-p and typical sampling
//! - Per-slot stopping on EOS, token limit or stop strings

pub mod codec;
pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod model;

pub use codec::{HfTextCodec, TextCodec};
pub use config::{GenerationConfig, SamplingSettings};
pub use crate::core::{CacheConfig, SequenceCache, StopReason};
pub use engine::{GenerationOutput, Generator, Sampler, StepUpdate};
pub use error::{Error, Result};
pub use model::{
    download_model, load_config, load_local, load_safetensors, ForwardBatch, ForwardModel,
    ModelFiles, Qwen3Config, Qwen3ForCausalLM,
};
