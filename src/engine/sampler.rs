//! Token sampling.
//!
//! Every slot's next token goes through the same fixed pipeline:
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Repetition penalty (slot history, sustain + decay window)
//!     ▼ Disallowed tokens → -inf
//!     │
//!     ├── temperature == 0 ──► arg-max
//!     │
//!     ▼ Temperature scaling + softmax
//!     ▼ Top-k (optional)
//!     ▼ Top-p / min-p (optional)
//!     ▼ Typical (optional)
//!     │
//!     ▼ Renormalize + weighted draw
//! Selected token
//! ```
//!
//! When the filters leave no candidate with positive finite mass the sampler
//! falls back to the arg-max of the penalized logits.

use std::cmp::Ordering;

use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingSettings;
use crate::error::{Error, Result};

/// Token sampler holding the session's settings and RNG.
#[derive(Debug, Clone)]
pub struct Sampler {
    settings: SamplingSettings,
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from entropy.
    pub fn new(settings: SamplingSettings) -> Self {
        Self {
            settings,
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates a sampler with a specific seed for reproducibility.
    pub fn with_seed(settings: SamplingSettings, seed: u64) -> Self {
        Self {
            settings,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Get the sampling settings.
    pub fn settings(&self) -> &SamplingSettings {
        &self.settings
    }

    /// Samples one token from a `[vocab_size]` logit row.
    ///
    /// # Arguments
    ///
    /// * `logits` - Raw logits for one slot
    /// * `history` - The slot's prompt and generated tokens, oldest first
    pub fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32> {
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        self.sample_logits(logits, history)
    }

    /// Runs the sampling pipeline on a plain logit vector.
    pub fn sample_logits(&mut self, mut logits: Vec<f32>, history: &[u32]) -> Result<u32> {
        let settings = &self.settings;
        apply_repetition_penalty(
            &mut logits,
            history,
            settings.token_repetition_penalty_max,
            settings.token_repetition_penalty_sustain,
            settings.token_repetition_penalty_decay,
        );
        for &token in &settings.disallowed_tokens {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }

        if settings.is_greedy() {
            return self.fallback(&logits);
        }

        let mut candidates = softmax_candidates(&logits, settings);
        sort_descending(&mut candidates);

        if settings.top_k > 0 {
            candidates.truncate(settings.top_k);
            renormalize(&mut candidates);
        }
        if settings.top_p > 0.0 && settings.top_p < 1.0 {
            apply_top_p(&mut candidates, settings.top_p, settings.min_p);
            renormalize(&mut candidates);
        }
        if settings.typical > 0.0 && settings.typical < 1.0 {
            apply_typical(&mut candidates, settings.typical);
            renormalize(&mut candidates);
        }

        if candidates.is_empty() {
            return self.fallback(&logits);
        }
        let weights: Vec<f32> = candidates.iter().map(|&(_, p)| p).collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => Ok(candidates[dist.sample(&mut self.rng)].0),
            Err(e) => {
                tracing::debug!("weighted draw failed ({e}), using arg-max");
                self.fallback(&logits)
            }
        }
    }

    /// Arg-max over finite, allowed logits, else the lowest allowed id.
    fn fallback(&self, logits: &[f32]) -> Result<u32> {
        let disallowed = &self.settings.disallowed_tokens;
        let allowed = |id: &usize| !disallowed.contains(&(*id as u32));

        let best = logits
            .iter()
            .enumerate()
            .filter(|(id, l)| allowed(id) && l.is_finite())
            .fold(None, |best: Option<(usize, f32)>, (id, &l)| match best {
                Some((_, b)) if b >= l => best,
                _ => Some((id, l)),
            });
        if let Some((id, _)) = best {
            return Ok(id as u32);
        }

        tracing::debug!("no finite logit left, using lowest allowed id");
        (0..logits.len())
            .find(allowed)
            .map(|id| id as u32)
            .ok_or_else(|| Error::Config("every token id is disallowed".into()))
    }
}

/// Penalizes tokens that occur in the recent history.
///
/// Walking back from the newest token, the first `sustain` positions carry the
/// full `penalty_max`; over the next `decay` positions the penalty falls
/// linearly to 1. Each token is penalized once, by its most recent occurrence.
/// Positive logits are divided by the penalty, others multiplied.
pub fn apply_repetition_penalty(
    logits: &mut [f32],
    history: &[u32],
    penalty_max: f32,
    sustain: usize,
    decay: usize,
) {
    if penalty_max <= 1.0 {
        return;
    }
    let window = sustain.saturating_add(decay);
    let mut seen = vec![false; logits.len()];

    for (distance, &token) in history.iter().rev().take(window).enumerate() {
        let id = token as usize;
        if id >= logits.len() || seen[id] {
            continue;
        }
        seen[id] = true;

        let penalty = if distance < sustain {
            penalty_max
        } else {
            let step = (distance - sustain + 1) as f32;
            penalty_max + (1.0 - penalty_max) * step / decay as f32
        };
        let logit = &mut logits[id];
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

/// Temperature softmax restricted to tokens with positive finite mass.
fn softmax_candidates(logits: &[f32], settings: &SamplingSettings) -> Vec<(u32, f32)> {
    let temperature = settings.temperature;
    let max = logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Vec::new();
    }

    let mut candidates: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .filter(|(id, l)| l.is_finite() && !settings.disallowed_tokens.contains(&(*id as u32)))
        .map(|(id, &l)| (id as u32, ((l - max) / temperature).exp()))
        .filter(|&(_, p)| p > 0.0 && p.is_finite())
        .collect();
    renormalize(&mut candidates);
    candidates
}

fn sort_descending(candidates: &mut [(u32, f32)]) {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
}

fn renormalize(candidates: &mut Vec<(u32, f32)>) {
    let sum: f32 = candidates.iter().map(|&(_, p)| p).sum();
    if sum > 0.0 && sum.is_finite() {
        for (_, p) in candidates.iter_mut() {
            *p /= sum;
        }
    } else {
        candidates.clear();
    }
}

/// Keeps the smallest descending prefix whose mass reaches `top_p`, dropping
/// tokens below `min_p` after the first.
fn apply_top_p(candidates: &mut Vec<(u32, f32)>, top_p: f32, min_p: f32) {
    let mut cumulative = 0.0f32;
    let mut keep = 0;
    for (i, &(_, p)) in candidates.iter().enumerate() {
        if i > 0 && p < min_p {
            break;
        }
        cumulative += p;
        keep = i + 1;
        if cumulative >= top_p {
            break;
        }
    }
    candidates.truncate(keep);
}

/// Locally typical filtering: prefer tokens whose surprisal is closest to the
/// distribution's entropy.
fn apply_typical(candidates: &mut Vec<(u32, f32)>, typical: f32) {
    let entropy: f32 = candidates.iter().map(|&(_, p)| -p * p.ln()).sum();
    candidates.sort_by(|a, b| {
        let da = (-a.1.ln() - entropy).abs();
        let db = (-b.1.ln() - entropy).abs();
        da.partial_cmp(&db).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0))
    });

    let mut cumulative = 0.0f32;
    let mut keep = candidates.len();
    for (i, &(_, p)) in candidates.iter().enumerate() {
        cumulative += p;
        if cumulative >= typical {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep);
}
