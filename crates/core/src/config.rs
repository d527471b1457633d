//! Configuration for retrieval-augmented generation.
//!
//! `RagConfig` mirrors the JSON layout of a RAG checkpoint's `config.json`
//! restricted to the fields the decoding engine reads. Every field has a
//! default so partial documents parse.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Special token ids shared by the generator and the decoders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenIds {
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub pad_token_id: u32,
    pub decoder_start_token_id: u32,
}

impl Default for TokenIds {
    fn default() -> Self {
        Self {
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: 0,
            decoder_start_token_id: 0,
        }
    }
}

/// Decoding parameters shared by both RAG strategies and forwarded to the
/// generator's standalone `generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_length: usize,
    pub min_length: usize,
    pub num_beams: usize,
    pub early_stopping: bool,
    pub length_penalty: f32,
    /// Size of n-grams that may not repeat (0 = disabled).
    pub no_repeat_ngram_size: usize,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,
    pub num_return_sequences: usize,
    pub repetition_penalty: f32,
    pub do_sample: bool,
    pub temperature: f32,
    /// Top-k truncation when sampling (0 = disabled).
    pub top_k: usize,
    pub top_p: f32,
    pub use_cache: bool,
    /// Seed for the sampler RNG; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            min_length: 0,
            num_beams: 1,
            early_stopping: false,
            length_penalty: 1.0,
            no_repeat_ngram_size: 0,
            bad_words_ids: None,
            num_return_sequences: 1,
            repetition_penalty: 1.0,
            do_sample: false,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            use_cache: true,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn greedy(max_length: usize) -> Self {
        Self {
            max_length,
            ..Default::default()
        }
    }

    pub fn beam_search(num_beams: usize, max_length: usize) -> Self {
        Self {
            num_beams,
            max_length,
            ..Default::default()
        }
    }

    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }

    /// Reject a request for more sequences per query than the decoder has
    /// candidates to return (`num_beams` for RAG-Token, `n_docs * num_beams`
    /// for RAG-Sequence).
    pub fn validate_return_sequences(&self, candidates: usize) -> Result<()> {
        if self.num_return_sequences > candidates {
            return Err(RagError::InvalidParams(format!(
                "num_return_sequences ({}) exceeds the {candidates} candidates per query",
                self.num_return_sequences
            )));
        }
        Ok(())
    }

    /// Reject parameter combinations the decoders cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            return Err(RagError::InvalidParams("num_beams must be at least 1".into()));
        }
        if self.max_length == 0 {
            return Err(RagError::InvalidParams("max_length must be at least 1".into()));
        }
        if self.num_return_sequences == 0 {
            return Err(RagError::InvalidParams(
                "num_return_sequences must be at least 1".into(),
            ));
        }
        if self.temperature <= 0.0 {
            return Err(RagError::InvalidParams("temperature must be positive".into()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(RagError::InvalidParams(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(RagError::InvalidParams(
                "repetition_penalty must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Documents retrieved per query.
    pub n_docs: usize,
    /// Upper bound on a retrieved context row (document text plus query).
    pub max_combined_length: usize,
    /// Label smoothing epsilon for the NLL losses.
    pub label_smoothing: f64,
    /// Sum the per-example loss into a scalar.
    pub reduce_loss: bool,
    /// Return document-marginalized logits from the token-level forward.
    pub do_marginalize: bool,
    /// Drop the shared BOS score from sequence-level likelihoods.
    pub exclude_bos_score: bool,
    pub do_deduplication: bool,
    /// Return retrieved contexts and embeddings alongside the logits.
    pub output_retrieved: bool,
    pub tokens: TokenIds,
    pub generation: GenerationConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            n_docs: 5,
            max_combined_length: 300,
            label_smoothing: 0.0,
            reduce_loss: false,
            do_marginalize: false,
            exclude_bos_score: false,
            do_deduplication: true,
            output_retrieved: false,
            tokens: TokenIds::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl RagConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_docs == 0 {
            return Err(RagError::InvalidParams("n_docs must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(RagError::InvalidParams(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        self.generation.validate()
    }
}
