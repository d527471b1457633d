//! Question encoder → retriever → doc scores → generator.

use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::{DocSet, Generator, QuestionEncoder, Retriever};
use crate::cache::{EncoderState, LayerCache};
use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::layout::repeat_interleave;
use crate::marginalize::queries_for_rows;

/// Inputs to one composition-layer forward pass.
///
/// Either a retriever is configured and `input_ids` is given, or the caller
/// supplies `context_input_ids`, `context_attention_mask` and `doc_scores`
/// together. A precomputed `encoder_state` replaces the context ids.
#[derive(Debug, Clone, Default)]
pub struct RagInputs {
    pub input_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub context_input_ids: Option<Tensor>,
    pub context_attention_mask: Option<Tensor>,
    pub doc_scores: Option<Tensor>,
    pub encoder_state: Option<EncoderState>,
    /// `[batch, tgt_len]`, repeated across documents internally.
    pub decoder_input_ids: Option<Tensor>,
    pub past: Option<Vec<LayerCache>>,
    pub n_docs: Option<usize>,
}

/// What the retriever produced for a batch, kept for callers that ask for it.
#[derive(Debug, Clone)]
pub struct RetrievedDocs {
    pub question_embedding: Tensor,
    pub doc_embeds: Tensor,
    pub doc_ids: Vec<Vec<u64>>,
}

/// Context rows and doc scores ready for the generator.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub context_input_ids: Option<Tensor>,
    pub context_attention_mask: Option<Tensor>,
    /// `[batch, n_docs]`
    pub doc_scores: Tensor,
    pub retrieved: Option<RetrievedDocs>,
}

#[derive(Debug, Clone)]
pub struct RagOutput {
    /// Per-document generator logits, `[batch * n_docs, tgt_len, vocab]`.
    pub logits: Tensor,
    pub doc_scores: Tensor,
    pub past: Option<Vec<LayerCache>>,
    pub encoder_state: EncoderState,
    pub context_input_ids: Option<Tensor>,
    pub context_attention_mask: Option<Tensor>,
    pub retrieved: Option<RetrievedDocs>,
}

pub struct RagModel {
    question_encoder: Arc<dyn QuestionEncoder>,
    generator: Arc<dyn Generator>,
    retriever: Option<Arc<dyn Retriever>>,
    config: RagConfig,
}

impl RagModel {
    pub fn new(
        question_encoder: Arc<dyn QuestionEncoder>,
        generator: Arc<dyn Generator>,
        retriever: Option<Arc<dyn Retriever>>,
        config: RagConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            question_encoder,
            generator,
            retriever,
            config,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn generator(&self) -> &dyn Generator {
        self.generator.as_ref()
    }

    pub fn retriever(&self) -> Option<&Arc<dyn Retriever>> {
        self.retriever.as_ref()
    }

    pub fn n_docs(&self, n_docs: Option<usize>) -> usize {
        n_docs.unwrap_or(self.config.n_docs)
    }

    /// Doc scores as the dot product of each query embedding with its
    /// documents' embeddings: `[batch, dim] x [batch, n_docs, dim] -> [batch, n_docs]`.
    pub fn doc_scores(question_embedding: &Tensor, doc_embeds: &Tensor) -> Result<Tensor> {
        let question = question_embedding.to_dtype(DType::F32)?.unsqueeze(1)?;
        let docs = doc_embeds.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
        Ok(question.matmul(&docs)?.squeeze(1)?)
    }

    /// Encode the queries, retrieve `n_docs` documents each and score them.
    pub fn retrieve(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>, n_docs: usize) -> Result<ResolvedContext> {
        let Some(retriever) = &self.retriever else {
            return Err(RagError::MissingContext("context_input_ids"));
        };
        let question_embedding = self.question_encoder.encode(input_ids, attention_mask)?;
        let docs = retriever.retrieve(input_ids, &question_embedding, n_docs)?;
        validate_doc_set(&docs, &question_embedding, n_docs, self.config.max_combined_length)?;
        let doc_scores = Self::doc_scores(&question_embedding, &docs.doc_embeds)?;
        tracing::debug!(
            batch = question_embedding.dim(0)?,
            n_docs,
            "retrieved documents"
        );
        Ok(ResolvedContext {
            context_input_ids: Some(docs.context_input_ids),
            context_attention_mask: Some(docs.context_attention_mask),
            doc_scores,
            retrieved: Some(RetrievedDocs {
                question_embedding,
                doc_embeds: docs.doc_embeds,
                doc_ids: docs.doc_ids,
            }),
        })
    }

    /// Retrieve when needed, otherwise check that the caller supplied the
    /// context ids, mask and doc scores together.
    ///
    /// With `has_encoder_state`, context ids and mask may be omitted.
    pub fn resolve_context(&self, inputs: &RagInputs, n_docs: usize, has_encoder_state: bool) -> Result<ResolvedContext> {
        let incomplete = inputs.context_input_ids.is_none()
            || inputs.context_attention_mask.is_none()
            || inputs.doc_scores.is_none();
        let resolved = if self.retriever.is_some() && incomplete && !has_encoder_state {
            let input_ids = inputs
                .input_ids
                .as_ref()
                .ok_or(RagError::MissingContext("input_ids"))?;
            self.retrieve(input_ids, inputs.attention_mask.as_ref(), n_docs)?
        } else {
            if !has_encoder_state {
                if inputs.context_input_ids.is_none() {
                    return Err(RagError::MissingContext("context_input_ids"));
                }
                if inputs.context_attention_mask.is_none() {
                    return Err(RagError::MissingContext("context_attention_mask"));
                }
            }
            let doc_scores = inputs
                .doc_scores
                .clone()
                .ok_or(RagError::MissingContext("doc_scores"))?;
            ResolvedContext {
                context_input_ids: inputs.context_input_ids.clone(),
                context_attention_mask: inputs.context_attention_mask.clone(),
                doc_scores,
                retrieved: None,
            }
        };

        if let Some(context) = &resolved.context_input_ids {
            let rows = context.dim(0)?;
            let batch = queries_for_rows(rows, n_docs)?;
            let dims = resolved.doc_scores.dims();
            if dims != [batch, n_docs] {
                return Err(RagError::RetrievalMismatch(format!(
                    "doc_scores has shape {dims:?}, expected [{batch}, {n_docs}]"
                )));
            }
        }
        Ok(resolved)
    }

    /// Run the generator over every (query, document) row.
    ///
    /// Decoder inputs are repeated `n_docs` times so each document row
    /// decodes the same target.
    pub fn forward(&self, inputs: RagInputs) -> Result<RagOutput> {
        let n_docs = self.n_docs(inputs.n_docs);
        let has_encoder_state = inputs.encoder_state.is_some();
        let context = self.resolve_context(&inputs, n_docs, has_encoder_state)?;

        let decoder_input_ids = inputs
            .decoder_input_ids
            .as_ref()
            .ok_or_else(|| RagError::InvalidParams("decoder_input_ids are required".into()))?;
        let decoder_input_ids = repeat_interleave(decoder_input_ids, n_docs)?;

        let encoder_state = match inputs.encoder_state {
            Some(state) => state,
            None => {
                let context_ids = context
                    .context_input_ids
                    .as_ref()
                    .ok_or(RagError::MissingContext("context_input_ids"))?;
                self.generator
                    .encode(context_ids, context.context_attention_mask.as_ref())?
            }
        };
        let rows = encoder_state.rows()?;
        queries_for_rows(rows, n_docs)?;
        if decoder_input_ids.dim(0)? != rows {
            return Err(RagError::DocCountMismatch {
                rows: decoder_input_ids.dim(0)?,
                n_docs,
            });
        }

        let output = self.generator.decode_step(
            &decoder_input_ids,
            &encoder_state,
            context.context_attention_mask.as_ref(),
            inputs.past.as_deref(),
        )?;

        Ok(RagOutput {
            logits: output.logits,
            doc_scores: context.doc_scores,
            past: output.past,
            encoder_state,
            context_input_ids: context.context_input_ids,
            context_attention_mask: context.context_attention_mask,
            retrieved: context.retrieved,
        })
    }
}

fn validate_doc_set(docs: &DocSet, question_embedding: &Tensor, n_docs: usize, max_combined_length: usize) -> Result<()> {
    let (batch, dim) = question_embedding.dims2()?;
    let (rows, width) = docs.context_input_ids.dims2()?;
    if rows != batch * n_docs {
        return Err(RagError::RetrievalMismatch(format!(
            "{rows} context rows for {batch} queries x {n_docs} docs"
        )));
    }
    if width > max_combined_length {
        return Err(RagError::RetrievalMismatch(format!(
            "context rows of length {width} exceed max_combined_length {max_combined_length}"
        )));
    }
    if docs.context_attention_mask.dims() != docs.context_input_ids.dims() {
        return Err(RagError::RetrievalMismatch(format!(
            "context mask shape {:?} differs from context ids {:?}",
            docs.context_attention_mask.dims(),
            docs.context_input_ids.dims()
        )));
    }
    let embeds = docs.doc_embeds.dims();
    if embeds != [batch, n_docs, dim] {
        return Err(RagError::RetrievalMismatch(format!(
            "doc_embeds has shape {embeds:?}, expected [{batch}, {n_docs}, {dim}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_rag, ScriptedGenerator, StaticQuestionEncoder, StaticRetriever};
    use candle_core::Device;

    fn context_inputs(batch: usize, n_docs: usize) -> RagInputs {
        let rows = batch * n_docs;
        RagInputs {
            context_input_ids: Some(Tensor::zeros((rows, 3), DType::U32, &Device::Cpu).unwrap()),
            context_attention_mask: Some(Tensor::ones((rows, 3), DType::U32, &Device::Cpu).unwrap()),
            doc_scores: Some(Tensor::zeros((batch, n_docs), DType::F32, &Device::Cpu).unwrap()),
            decoder_input_ids: Some(Tensor::new(&[[1u32, 3]], &Device::Cpu).unwrap().repeat((batch, 1)).unwrap()),
            n_docs: Some(n_docs),
            ..Default::default()
        }
    }

    // ─── Preconditions ───────────────────────────────────────────────────────

    #[test]
    fn missing_doc_scores_without_retriever() {
        let model = scripted_rag(ScriptedGenerator::constant(5, 3), None, 2);
        let mut inputs = context_inputs(1, 2);
        inputs.doc_scores = None;
        let err = model.forward(inputs).unwrap_err();
        assert!(matches!(err, RagError::MissingContext("doc_scores")));
    }

    #[test]
    fn missing_context_mask_without_retriever() {
        let model = scripted_rag(ScriptedGenerator::constant(5, 3), None, 2);
        let mut inputs = context_inputs(1, 2);
        inputs.context_attention_mask = None;
        let err = model.forward(inputs).unwrap_err();
        assert!(matches!(err, RagError::MissingContext("context_attention_mask")));
    }

    #[test]
    fn indivisible_context_rows_rejected() {
        let model = scripted_rag(ScriptedGenerator::constant(5, 3), None, 2);
        let mut inputs = context_inputs(1, 2);
        inputs.context_input_ids = Some(Tensor::zeros((3, 3), DType::U32, &Device::Cpu).unwrap());
        let err = model.forward(inputs).unwrap_err();
        assert!(matches!(err, RagError::DocCountMismatch { rows: 3, n_docs: 2 }));
    }

    // ─── Forward ─────────────────────────────────────────────────────────────

    #[test]
    fn forward_repeats_decoder_inputs_per_doc() {
        let model = scripted_rag(ScriptedGenerator::constant(5, 3), None, 2);
        let out = model.forward(context_inputs(2, 2)).unwrap();
        assert_eq!(out.logits.dims(), &[4, 2, 5]);
        assert_eq!(out.doc_scores.dims(), &[2, 2]);
        assert!(out.past.is_some());
    }

    #[test]
    fn forward_with_retriever_scores_documents() {
        let question = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        let retriever = StaticRetriever::new(
            Tensor::new(&[[4u32, 4], [5, 5]], &Device::Cpu).unwrap(),
            Tensor::new(&[[[2f32, 0.0], [0.5, 9.0]]], &Device::Cpu).unwrap(),
        );
        let model = RagModel::new(
            Arc::new(StaticQuestionEncoder::new(question)),
            Arc::new(ScriptedGenerator::constant(5, 3)),
            Some(Arc::new(retriever)),
            RagConfig {
                n_docs: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let out = model
            .forward(RagInputs {
                input_ids: Some(Tensor::new(&[[7u32, 8]], &Device::Cpu).unwrap()),
                decoder_input_ids: Some(Tensor::new(&[[1u32]], &Device::Cpu).unwrap()),
                ..Default::default()
            })
            .unwrap();
        let scores = out.doc_scores.to_vec2::<f32>().unwrap();
        assert_eq!(scores, vec![vec![2.0, 0.5]]);
        assert!(out.retrieved.is_some());
        assert_eq!(out.context_input_ids.unwrap().dims(), &[2, 2]);
    }

    #[test]
    fn retriever_with_wrong_doc_count_rejected() {
        let question = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        let retriever = StaticRetriever::new(
            Tensor::new(&[[4u32, 4], [5, 5]], &Device::Cpu).unwrap(),
            Tensor::new(&[[[2f32, 0.0], [0.5, 9.0]]], &Device::Cpu).unwrap(),
        );
        let model = RagModel::new(
            Arc::new(StaticQuestionEncoder::new(question)),
            Arc::new(ScriptedGenerator::constant(5, 3)),
            Some(Arc::new(retriever)),
            RagConfig {
                n_docs: 3,
                ..Default::default()
            },
        )
        .unwrap();
        let err = model
            .retrieve(&Tensor::new(&[[7u32]], &Device::Cpu).unwrap(), None, 3)
            .unwrap_err();
        assert!(matches!(err, RagError::RetrievalMismatch(_)));
    }

    #[test]
    fn retrieved_context_longer_than_max_combined_length_rejected() {
        let question = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        let retriever = StaticRetriever::new(
            Tensor::new(&[[4u32, 4, 4], [5, 5, 5]], &Device::Cpu).unwrap(),
            Tensor::new(&[[[2f32, 0.0], [0.5, 9.0]]], &Device::Cpu).unwrap(),
        );
        let model = RagModel::new(
            Arc::new(StaticQuestionEncoder::new(question)),
            Arc::new(ScriptedGenerator::constant(5, 3)),
            Some(Arc::new(retriever)),
            RagConfig {
                n_docs: 2,
                max_combined_length: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let err = model
            .retrieve(&Tensor::new(&[[7u32]], &Device::Cpu).unwrap(), None, 2)
            .unwrap_err();
        assert!(matches!(err, RagError::RetrievalMismatch(msg) if msg.contains("max_combined_length")));
    }
}
