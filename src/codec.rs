//! Text codec interface and the HuggingFace tokenizer binding.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// Maps text to token ids and back.
///
/// `decode(encode(text))` must reproduce `text` for any text the codec encoded
/// itself. Special tokens (BOS, EOS) are dropped by `decode`.
pub trait TextCodec {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// The designated end-of-sequence id.
    fn eos_token_id(&self) -> u32;
}

/// Tokens tried, in order, when looking up the end-of-sequence id.
const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|end_of_text|>"];

/// [`TextCodec`] backed by a `tokenizer.json` file.
pub struct HfTextCodec {
    tokenizer: Tokenizer,
    eos_token_id: u32,
}

impl HfTextCodec {
    /// Wraps a tokenizer, resolving the end-of-sequence id from its vocabulary.
    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .ok_or_else(|| Error::Tokenization("no end-of-sequence token in vocabulary".into()))?;
        Ok(Self {
            tokenizer,
            eos_token_id,
        })
    }

    /// Loads a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            Error::Tokenization(format!("failed to load {}: {e}", path.display()))
        })?;
        Self::new(tokenizer)
    }

    /// Overrides the end-of-sequence id.
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }

    /// Get reference to the tokenizer.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

impl TextCodec for HfTextCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}
