//! RAG-Sequence: generate candidates per document, then rescore each one
//! against every document and keep the best.

use std::collections::HashSet;

use candle_core::Tensor;

use super::{ForwardOptions, GenerateRequest, RagGeneration, RagLmOutput};
use crate::error::{RagError, Result};
use crate::layout::{cat_and_pad, tile_rows};
use crate::loss::{sequence_nll, LossOptions};
use crate::marginalize::queries_for_rows;
use crate::model::{RagInputs, RagModel};
use crate::sampling::top_candidates;

pub struct RagSequenceForGeneration {
    rag: RagModel,
}

impl RagSequenceForGeneration {
    pub fn new(rag: RagModel) -> Self {
        Self { rag }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_nll(
        &self,
        seq_logits: &Tensor,
        doc_scores: &Tensor,
        target: &Tensor,
        reduce_loss: bool,
        epsilon: f64,
        exclude_bos_score: bool,
        n_docs: Option<usize>,
    ) -> Result<Tensor> {
        let tokens = &self.rag.config().tokens;
        let opts = LossOptions {
            n_docs: self.rag.n_docs(n_docs),
            pad_token_id: tokens.pad_token_id,
            bos_token_id: tokens.bos_token_id,
            epsilon,
            reduce_loss,
            exclude_bos_score,
        };
        sequence_nll(seq_logits, doc_scores, target, &opts)
    }

    /// Per-candidate sequence NLL for one query.
    fn score_candidates(
        &self,
        request: &GenerateRequest,
        query: usize,
        candidates: &Tensor,
        context: (&Tensor, &Tensor, &Tensor),
        n_docs: usize,
    ) -> Result<Vec<f32>> {
        let num_candidates = candidates.dim(0)?;
        let mut inputs = RagInputs {
            n_docs: Some(n_docs),
            ..Default::default()
        };
        match (&request.input_ids, self.rag.retriever()) {
            (Some(input_ids), Some(_)) => {
                inputs.input_ids = Some(tile_rows(&input_ids.narrow(0, query, 1)?, num_candidates)?);
                inputs.attention_mask = request
                    .attention_mask
                    .as_ref()
                    .map(|mask| tile_rows(&mask.narrow(0, query, 1)?, num_candidates))
                    .transpose()?;
            }
            _ => {
                let (context_ids, context_mask, doc_scores) = context;
                inputs.context_input_ids = Some(tile_rows(context_ids, num_candidates)?);
                inputs.context_attention_mask = Some(tile_rows(context_mask, num_candidates)?);
                inputs.doc_scores = Some(tile_rows(doc_scores, num_candidates)?);
            }
        }
        let options = ForwardOptions {
            labels: Some(candidates.clone()),
            reduce_loss: Some(false),
            exclude_bos_score: Some(true),
            ..Default::default()
        };
        let loss = self
            .forward(inputs, options)?
            .loss
            .ok_or(RagError::MissingContext("labels"))?;
        Ok(loss.to_vec1::<f32>()?)
    }
}

/// Drop repeated rows, keeping first occurrences in order.
fn deduplicate(sequences: &Tensor) -> Result<Tensor> {
    let rows = sequences.to_vec2::<u32>()?;
    let mut seen = HashSet::with_capacity(rows.len());
    let keep: Vec<u32> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| seen.insert(*row))
        .map(|(i, _)| i as u32)
        .collect();
    if keep.len() == rows.len() {
        return Ok(sequences.clone());
    }
    let index = Tensor::new(keep.as_slice(), sequences.device())?;
    Ok(sequences.index_select(&index, 0)?)
}

impl RagGeneration for RagSequenceForGeneration {
    fn rag(&self) -> &RagModel {
        &self.rag
    }

    fn forward(&self, mut inputs: RagInputs, options: ForwardOptions) -> Result<RagLmOutput> {
        let config = self.rag.config();
        let n_docs = self.rag.n_docs(inputs.n_docs);
        inputs.n_docs = Some(n_docs);
        if inputs.decoder_input_ids.is_none() {
            inputs.decoder_input_ids = options.labels.clone();
        }
        let reduce_loss = options.reduce_loss.unwrap_or(config.reduce_loss);
        let exclude_bos_score = options.exclude_bos_score.unwrap_or(config.exclude_bos_score);

        let output = self.rag.forward(inputs)?;
        let loss = options
            .labels
            .as_ref()
            .map(|labels| {
                self.get_nll(
                    &output.logits,
                    &output.doc_scores,
                    labels,
                    reduce_loss,
                    config.label_smoothing,
                    exclude_bos_score,
                    Some(n_docs),
                )
            })
            .transpose()?;
        let output_retrieved = config.output_retrieved;
        Ok(RagLmOutput {
            loss,
            logits: output.logits,
            doc_scores: output.doc_scores,
            past: output.past,
            context_input_ids: output.context_input_ids.filter(|_| output_retrieved),
            context_attention_mask: output.context_attention_mask.filter(|_| output_retrieved),
            retrieved: output.retrieved.filter(|_| output_retrieved),
        })
    }

    fn generate(&self, request: GenerateRequest) -> Result<Tensor> {
        let config = self.rag.config();
        let params = request.params.clone().unwrap_or_else(|| config.generation.clone());
        params.validate()?;
        let n_docs = self.rag.n_docs(request.n_docs);
        params.validate_return_sequences(n_docs * params.num_beams)?;
        let do_deduplication = request.do_deduplication.unwrap_or(config.do_deduplication);
        let num_return_sequences = params.num_return_sequences;

        let context = self
            .rag
            .resolve_context(&request.rag_inputs(n_docs), n_docs, false)?;
        let context_input_ids = context
            .context_input_ids
            .as_ref()
            .ok_or(RagError::MissingContext("context_input_ids"))?;
        let context_attention_mask = context
            .context_attention_mask
            .as_ref()
            .ok_or(RagError::MissingContext("context_attention_mask"))?;
        let batch = queries_for_rows(context_input_ids.dim(0)?, n_docs)?;

        tracing::info!(
            batch,
            n_docs,
            num_beams = params.num_beams,
            num_return_sequences,
            do_deduplication,
            "rag-sequence generate"
        );

        let mut generator_params = params.clone();
        generator_params.num_return_sequences = params.num_beams;

        let mut hypos = Vec::with_capacity(batch);
        for query in 0..batch {
            let context_ids = context_input_ids.narrow(0, query * n_docs, n_docs)?;
            let context_mask = context_attention_mask.narrow(0, query * n_docs, n_docs)?;
            let doc_scores = context.doc_scores.narrow(0, query, 1)?;

            let mut candidates = self.rag.generator().generate(
                &context_ids,
                Some(&context_mask),
                &generator_params,
                &config.tokens,
            )?;
            let generated = candidates.dim(0)?;
            if do_deduplication {
                candidates = deduplicate(&candidates)?;
            }
            tracing::debug!(query, generated, unique = candidates.dim(0)?, "sequence candidates");

            let scores = self.score_candidates(
                &request,
                query,
                &candidates,
                (&context_ids, &context_mask, &doc_scores),
                n_docs,
            )?;
            let neg_loss: Vec<f32> = scores.iter().map(|loss| -loss).collect();
            let top = top_candidates(&neg_loss, num_return_sequences.min(neg_loss.len()));
            tracing::debug!(query, best_loss = top.first().map(|c| -c.score), "rescored candidates");
            let index: Vec<u32> = top.iter().map(|c| c.flat_index as u32).collect();
            let index = Tensor::new(index.as_slice(), candidates.device())?;
            hypos.push(candidates.index_select(&index, 0)?);
        }

        cat_and_pad(&hypos, config.tokens.pad_token_id)
    }
}
