//! Model file discovery and weight loading.
//!
//! Models come either from a local directory holding `config.json`,
//! `tokenizer.json` and one or more `*.safetensors` files, or from the
//! HuggingFace Hub.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Paths to model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors).
    pub weights: Vec<PathBuf>,
    /// Path to tokenizer.json.
    pub tokenizer: PathBuf,
}

/// Locates model files inside a local directory.
pub fn load_local(model_dir: impl AsRef<Path>) -> Result<ModelFiles> {
    let dir = model_dir.as_ref();
    let config = dir.join("config.json");
    let tokenizer = dir.join("tokenizer.json");
    for path in [&config, &tokenizer] {
        if !path.is_file() {
            return Err(Error::ModelLoad(format!("missing {}", path.display())));
        }
    }

    let mut weights = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            weights.push(path);
        }
    }
    if weights.is_empty() {
        return Err(Error::ModelLoad(format!(
            "no *.safetensors files in {}",
            dir.display()
        )));
    }
    weights.sort();

    tracing::info!("Found {} weight file(s) in {}", weights.len(), dir.display());
    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}

/// Downloads model files from HuggingFace Hub.
///
/// # Arguments
///
/// * `model_id` - HuggingFace model ID (e.g., "Qwen/Qwen3-0.6B")
/// * `revision` - Git revision (branch, tag, or commit hash)
pub fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    tracing::info!("Fetching {model_id}@{revision} from the HuggingFace Hub");
    let api = Api::new().map_err(|e| Error::ModelLoad(format!("failed to create HF API: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo
        .get("config.json")
        .map_err(|e| Error::ModelLoad(format!("failed to download config.json: {e}")))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| Error::ModelLoad(format!("failed to download tokenizer.json: {e}")))?;
    let weights = download_weights(&repo)?;

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}

fn download_weights(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = repo.get("model.safetensors.index.json").map_err(|e| {
        Error::ModelLoad(format!("no SafeTensors weights found: {e}"))
    })?;
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| Error::ModelLoad("invalid safetensors index: missing weight_map".into()))?;

    let mut shards: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    shards.sort_unstable();
    shards.dedup();

    shards
        .into_iter()
        .map(|name| {
            repo.get(name)
                .map_err(|e| Error::ModelLoad(format!("failed to download {name}: {e}")))
        })
        .collect()
}

/// Creates a VarBuilder over memory-mapped SafeTensors files.
///
/// # Safety
///
/// The files are memory-mapped; they must not be modified while loaded.
#[allow(unsafe_code)]
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Loads Qwen3 configuration from config.json.
pub fn load_config(path: impl AsRef<Path>) -> Result<Qwen3Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::ModelLoad(format!("failed to read config.json: {e}")))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("failed to parse config.json: {e}")))
}

/// Qwen3 model configuration from HuggingFace config.json.
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen3Config {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,
    /// Dimension per attention head.
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Whether to tie word embeddings with lm_head.
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

fn default_head_dim() -> usize {
    128
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_max_position_embeddings() -> usize {
    40960
}

fn default_tie_word_embeddings() -> bool {
    true
}

impl Qwen3Config {
    /// A tiny configuration for tests and smoke runs.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            head_dim: 8,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            max_position_embeddings: 256,
            tie_word_embeddings: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qwen3_config_defaults() {
        let json = r#"{
            "vocab_size": 1000,
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2
        }"#;

        let config: Qwen3Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.vocab_size, 1000);
        assert_eq!(config.head_dim, 128);
        assert_eq!(config.max_position_embeddings, 40960);
        assert!(config.tie_word_embeddings);
    }

    #[test]
    fn test_load_local_reports_missing_files() {
        let dir = std::env::temp_dir().join(format!("nano-batchgen-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let err = load_local(&dir).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
