//! Generation engine.
//!
//! This module contains:
//! - Generator for running batched decoding sessions
//! - Sampler for token sampling

pub mod generator;
pub mod sampler;

pub use generator::{GenerationOutput, Generator, StepUpdate};
pub use sampler::{apply_repetition_penalty, Sampler};
