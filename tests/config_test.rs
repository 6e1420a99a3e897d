//! Integration tests for configuration loading and validation.

use nano_batchgen::{Error, GenerationConfig, SamplingSettings};

#[test]
fn test_partial_json_uses_defaults() {
    let json = r####"{
        "batch_size": 4,
        "stop_strings": ["###"],
        "sampling": { "temperature": 0.5, "disallowed_tokens": [2] }
    }"####;

    let config: GenerationConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.batch_size, 4);
    assert_eq!(config.max_new_tokens, 128);
    assert_eq!(config.stop_strings, vec!["###"]);
    assert_eq!(config.sampling.temperature, 0.5);
    assert_eq!(config.sampling.top_k, 40);
    assert_eq!(config.sampling.token_repetition_penalty_sustain, 256);
    assert!(config.sampling.disallowed_tokens.contains(&2));
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_round_trips_through_json() {
    let config = GenerationConfig::default()
        .batch_size(3)
        .seed(11)
        .sampling(SamplingSettings::greedy().disallow_tokens([0, 1]));

    let json = serde_json::to_string(&config).unwrap();
    let back: GenerationConfig = serde_json::from_str(&json).unwrap();

    assert_eq!(back, config);
}

#[test]
fn test_validation_failures() {
    let bad_sampling = [
        SamplingSettings { temperature: f32::NAN, ..Default::default() },
        SamplingSettings { top_p: 1.5, ..Default::default() },
        SamplingSettings { typical: -0.1, ..Default::default() },
        SamplingSettings { min_p: 2.0, ..Default::default() },
        SamplingSettings { token_repetition_penalty_max: 0.5, ..Default::default() },
    ];
    for sampling in bad_sampling {
        let config = GenerationConfig::default().sampling(sampling);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    assert!(GenerationConfig::default().batch_size(0).validate().is_err());
    assert!(GenerationConfig::default().max_seq_len(1).validate().is_err());
    assert!(GenerationConfig::default().stop_string("").validate().is_err());
}
