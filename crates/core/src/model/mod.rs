//! Collaborator contracts and the RAG composition layer.
//!
//! The question encoder, the retriever and the generator are opaque
//! capabilities: the core only calls the operations below and never assumes
//! anything about their layers or weights. All three are shared read-only
//! behind `Arc`, so implementations must be `Send + Sync`.

pub mod rag;

use candle_core::{Device, Result, Tensor};

use crate::cache::{EncoderState, LayerCache};
use crate::config::{GenerationConfig, TokenIds};

pub use rag::{RagInputs, RagModel, RagOutput, ResolvedContext, RetrievedDocs};

/// Embeds queries for retrieval.
pub trait QuestionEncoder: Send + Sync {
    /// `input_ids` is `[batch, seq_len]`; returns one embedding per query,
    /// `[batch, dim]`.
    fn encode(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor>;
}

/// Documents retrieved for a batch of queries, document-major per query.
#[derive(Debug, Clone)]
pub struct DocSet {
    /// `[batch * n_docs, max_combined_length]`
    pub context_input_ids: Tensor,
    /// `[batch * n_docs, max_combined_length]`
    pub context_attention_mask: Tensor,
    /// `[batch, n_docs, dim]`
    pub doc_embeds: Tensor,
    pub doc_ids: Vec<Vec<u64>>,
}

/// Nearest-neighbor document lookup.
pub trait Retriever: Send + Sync {
    /// Must return exactly `n_docs` documents per query, in rank order.
    fn retrieve(&self, input_ids: &Tensor, query_embeddings: &Tensor, n_docs: usize) -> Result<DocSet>;
}

/// Result of one generator decode call.
#[derive(Debug, Clone)]
pub struct GeneratorOutput {
    /// `[rows, tgt_len, vocab_size]`
    pub logits: Tensor,
    /// Updated decoder history, `None` when the generator keeps no cache.
    pub past: Option<Vec<LayerCache>>,
}

/// Sequence-to-sequence model conditioned on document contexts.
pub trait Generator: Send + Sync {
    /// Run the encoder over `[rows, src_len]` context ids.
    fn encode(&self, context_input_ids: &Tensor, context_attention_mask: Option<&Tensor>) -> Result<EncoderState>;

    /// Decode `decoder_input_ids` (`[rows, tgt_len]`) against `encoder_state`.
    ///
    /// With `past`, only the tokens not yet in the history are passed.
    fn decode_step(
        &self,
        decoder_input_ids: &Tensor,
        encoder_state: &EncoderState,
        attention_mask: Option<&Tensor>,
        past: Option<&[LayerCache]>,
    ) -> Result<GeneratorOutput>;

    /// Standalone decoding over `[rows, src_len]` contexts, returning
    /// `params.num_return_sequences` sequences per row as `[rows * k, len]`.
    fn generate(
        &self,
        context_input_ids: &Tensor,
        context_attention_mask: Option<&Tensor>,
        params: &GenerationConfig,
        tokens: &TokenIds,
    ) -> Result<Tensor>;

    /// Model-specific constraint on next-token logits (`[rows, vocab]`).
    fn adjust_logits_during_generation(&self, logits: Tensor, _cur_len: usize, _max_length: usize) -> Result<Tensor> {
        Ok(logits)
    }

    /// Decoder-only generators see the attention mask grow every step.
    fn is_encoder_decoder(&self) -> bool {
        true
    }

    fn vocab_size(&self) -> usize;

    fn device(&self) -> &Device;
}
