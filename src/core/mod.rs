//! Core session state.
//!
//! This module contains the fundamental building blocks:
//! - Sequence and BatchSlot for per-prompt tracking
//! - SequenceCache for preallocated key-value storage

pub mod kv_cache;
pub mod sequence;

pub use kv_cache::{CacheConfig, CacheRegion, SequenceCache};
pub use sequence::{BatchSlot, Sequence, SlotState, StopReason};
