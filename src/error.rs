//! Error types for nano-batchgen.

use thiserror::Error;

/// Result type alias for nano-batchgen operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-batchgen.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid generation or sampling configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Prompt count does not fit the configured batch size.
    #[error("got {prompts} prompts for a batch of size {batch_size}")]
    BatchSize { prompts: usize, batch_size: usize },

    /// A prompt encoded to zero tokens.
    #[error("prompt {0} encodes to an empty token sequence")]
    EmptyPrompt(usize),

    /// Cache allocation would exceed the memory available to the session.
    #[error("KV cache needs {requested} bytes but only {limit} are available")]
    ResourceExhausted { requested: usize, limit: usize },

    /// A cache write or length change past the region capacity.
    #[error("cache slot {slot}: position {position} exceeds capacity {capacity}")]
    CacheOverflow {
        slot: usize,
        position: usize,
        capacity: usize,
    },

    /// Slot index outside the allocated batch.
    #[error("cache slot {slot} out of range (batch size {batch_size})")]
    SlotOutOfRange { slot: usize, batch_size: usize },

    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
