//! RAG-Token and RAG-Sequence decoding.
//!
//! Both strategies implement [`RagGeneration`] over the same building blocks:
//! the marginalizer, the loss engine, the beam hypotheses store and the cache
//! reorder. The RAG-Token step loop lives in [`no_beam`] and [`beam_search`]
//! and only talks to the model through [`DecodeStep`], so a single step can be
//! driven in isolation.

pub mod beam_search;
pub mod no_beam;
pub mod sequence;
pub mod token;

use candle_core::Tensor;

use crate::cache::{GenerationCache, LayerCache};
use crate::config::{GenerationConfig, TokenIds};
use crate::error::Result;
use crate::model::{RagInputs, RagModel, RetrievedDocs};
use crate::sampling::BanRules;

pub use sequence::RagSequenceForGeneration;
pub use token::RagTokenForGeneration;

/// Per-call overrides for a forward pass with loss.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// `[batch, tgt_len]` target ids; also used as decoder inputs when none
    /// are given.
    pub labels: Option<Tensor>,
    pub reduce_loss: Option<bool>,
    pub do_marginalize: Option<bool>,
    pub exclude_bos_score: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RagLmOutput {
    /// `[batch]`, or a scalar when the loss is reduced.
    pub loss: Option<Tensor>,
    /// Per-document logits `[batch * n_docs, t, vocab]`, or marginalized
    /// `[batch, t, vocab]` log-probabilities for RAG-Token with marginalization.
    pub logits: Tensor,
    pub doc_scores: Tensor,
    pub past: Option<Vec<LayerCache>>,
    pub context_input_ids: Option<Tensor>,
    pub context_attention_mask: Option<Tensor>,
    pub retrieved: Option<RetrievedDocs>,
}

/// Inputs and overrides for one `generate` call.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub input_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub context_input_ids: Option<Tensor>,
    pub context_attention_mask: Option<Tensor>,
    pub doc_scores: Option<Tensor>,
    pub n_docs: Option<usize>,
    /// Replaces the model's generation config for this call.
    pub params: Option<GenerationConfig>,
    pub do_deduplication: Option<bool>,
}

impl GenerateRequest {
    pub(crate) fn rag_inputs(&self, n_docs: usize) -> RagInputs {
        RagInputs {
            input_ids: self.input_ids.clone(),
            attention_mask: self.attention_mask.clone(),
            context_input_ids: self.context_input_ids.clone(),
            context_attention_mask: self.context_attention_mask.clone(),
            doc_scores: self.doc_scores.clone(),
            n_docs: Some(n_docs),
            ..Default::default()
        }
    }
}

/// A RAG decoding strategy, chosen once per model instance.
pub trait RagGeneration {
    fn rag(&self) -> &RagModel;

    fn forward(&self, inputs: RagInputs, options: ForwardOptions) -> Result<RagLmOutput>;

    /// Returns `[batch * num_return_sequences, len]` token ids.
    fn generate(&self, request: GenerateRequest) -> Result<Tensor>;
}

/// Fixed inputs of one RAG-Token decode call.
pub struct DecodeInputs {
    pub params: GenerationConfig,
    pub tokens: TokenIds,
    pub rules: BanRules,
    /// Doc scores per decoder row, `[batch * num_beams, n_docs]`.
    pub doc_scores: Tensor,
    pub n_docs: usize,
    pub batch: usize,
    pub vocab_size: usize,
}

/// Decode state shared by both RAG-Token modes, moved through the step loop.
#[derive(Debug, Clone)]
pub struct DecodeState {
    /// One row per (batch, beam), start token included.
    pub sequences: Vec<Vec<u32>>,
    pub cur_len: usize,
    pub cache: GenerationCache,
    /// Context attention mask per (batch, beam, doc) row.
    pub attention_mask: Option<Tensor>,
}

impl DecodeState {
    pub fn new(start_token: u32, rows: usize, cache: GenerationCache, attention_mask: Option<Tensor>) -> Self {
        Self {
            sequences: vec![vec![start_token]; rows],
            cur_len: 1,
            cache,
            attention_mask,
        }
    }

    /// Append a column of ones to the attention mask.
    pub fn grow_attention_mask(self) -> Result<Self> {
        let Some(mask) = &self.attention_mask else {
            return Ok(self);
        };
        let ones = Tensor::ones((mask.dim(0)?, 1), mask.dtype(), mask.device())?;
        let grown = Tensor::cat(&[mask, &ones], 1)?;
        Ok(Self {
            attention_mask: Some(grown),
            ..self
        })
    }
}

/// Output of one model step.
pub struct StepOutput {
    /// Document-marginalized next-token log-probabilities, `[rows, vocab]`.
    pub scores: Tensor,
    pub past: Option<Vec<LayerCache>>,
}

/// What the RAG-Token step loops need from the model.
pub trait DecodeStep {
    fn next_token_scores(&self, inputs: &DecodeInputs, state: &DecodeState) -> Result<StepOutput>;

    fn adjust_logits(&self, logits: Tensor, _cur_len: usize, _max_length: usize) -> Result<Tensor> {
        Ok(logits)
    }

    fn is_encoder_decoder(&self) -> bool {
        true
    }
}
