//! Integration tests for Sampler.

use std::collections::HashSet;

use candle_core::{Device, Tensor};
use nano_batchgen::engine::apply_repetition_penalty;
use nano_batchgen::{Sampler, SamplingSettings};

fn test_settings() -> SamplingSettings {
    SamplingSettings {
        temperature: 1.0,
        top_k: 0,
        top_p: 0.0,
        min_p: 0.0,
        typical: 0.0,
        token_repetition_penalty_max: 1.0,
        ..SamplingSettings::default()
    }
}

#[test]
fn test_greedy_sampling() {
    let mut sampler = Sampler::with_seed(SamplingSettings::greedy(), 42);
    let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &Device::Cpu).unwrap();

    assert_eq!(sampler.sample(&logits, &[]).unwrap(), 3);
}

#[test]
fn test_penalty_monotonic_in_max() {
    let history = [0u32, 1, 2];
    let mut previous = vec![f32::INFINITY, f32::INFINITY];

    for penalty in [1.0f32, 1.1, 1.5, 2.0, 4.0] {
        let mut logits = vec![3.0, -3.0, 0.5, 1.0];
        apply_repetition_penalty(&mut logits, &history, penalty, 8, 0);

        // Repeated tokens only ever lose score as the penalty grows.
        assert!(logits[0] <= previous[0]);
        assert!(logits[1] <= previous[1]);
        // Tokens outside the history are untouched.
        assert_eq!(logits[3], 1.0);
        previous = vec![logits[0], logits[1]];
    }
}

#[test]
fn test_penalty_can_flip_greedy_choice() {
    let logits = vec![2.0f32, 1.5, 0.0];
    let history = [0u32];

    let mut mild = Sampler::with_seed(
        SamplingSettings {
            token_repetition_penalty_max: 1.1,
            ..SamplingSettings::greedy()
        },
        0,
    );
    let mut strong = Sampler::with_seed(
        SamplingSettings {
            token_repetition_penalty_max: 2.0,
            ..SamplingSettings::greedy()
        },
        0,
    );

    assert_eq!(mild.sample_logits(logits.clone(), &history).unwrap(), 0);
    assert_eq!(strong.sample_logits(logits, &history).unwrap(), 1);
}

#[test]
fn test_disallowed_never_chosen_under_any_filter() {
    let disallowed = [2u32, 5, 7];
    let variants = [
        test_settings(),
        SamplingSettings { top_k: 2, ..test_settings() },
        SamplingSettings { top_p: 0.3, ..test_settings() },
        SamplingSettings { typical: 0.4, ..test_settings() },
        SamplingSettings::default(),
        SamplingSettings::greedy(),
    ];

    for settings in variants {
        let mut sampler = Sampler::with_seed(settings.disallow_tokens(disallowed), 3);
        for i in 0..50 {
            // Disallowed ids carry the largest logits.
            let logits: Vec<f32> = (0..8)
                .map(|t| if disallowed.contains(&t) { 20.0 } else { (t + i) as f32 % 3.0 })
                .collect();
            let token = sampler.sample_logits(logits, &[2, 5, 7]).unwrap();
            assert!(!disallowed.contains(&token));
        }
    }
}

#[test]
fn test_top_k_one_is_reproducible() {
    let settings = SamplingSettings { top_k: 1, ..SamplingSettings::default() };
    let logits = vec![0.3f32, 2.0, 1.9, -1.0];

    let mut a = Sampler::new(settings.clone());
    let mut b = Sampler::new(settings);
    for _ in 0..20 {
        assert_eq!(a.sample_logits(logits.clone(), &[]).unwrap(), 1);
        assert_eq!(b.sample_logits(logits.clone(), &[]).unwrap(), 1);
    }
}

#[test]
fn test_fallback_when_all_logits_masked() {
    let mut sampler = Sampler::with_seed(test_settings().disallow_tokens([0]), 9);
    let logits = Tensor::new(
        &[f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY],
        &Device::Cpu,
    )
    .unwrap();

    assert_eq!(sampler.sample(&logits, &[]).unwrap(), 1);
}

#[test]
fn test_temperature_spreads_choices() {
    let mut cold = Sampler::with_seed(SamplingSettings { temperature: 0.02, ..test_settings() }, 1);
    let mut hot = Sampler::with_seed(SamplingSettings { temperature: 5.0, ..test_settings() }, 1);
    let logits = vec![1.0f32, 0.5, 0.0, -0.5];

    let cold_seen: HashSet<u32> = (0..100)
        .map(|_| cold.sample_logits(logits.clone(), &[]).unwrap())
        .collect();
    let hot_seen: HashSet<u32> = (0..100)
        .map(|_| hot.sample_logits(logits.clone(), &[]).unwrap())
        .collect();

    assert_eq!(cold_seen.len(), 1);
    assert!(hot_seen.len() > 1);
}
