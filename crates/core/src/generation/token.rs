//! RAG-Token: marginalize over documents at every generated token.

use candle_core::Tensor;

use super::{
    beam_search, no_beam, DecodeInputs, DecodeState, DecodeStep, ForwardOptions, GenerateRequest,
    RagGeneration, RagLmOutput, StepOutput,
};
use crate::cache::{EncoderState, GenerationCache};
use crate::error::{RagError, Result};
use crate::layout::{expand_for_beams, repeat_interleave};
use crate::loss::{shift_tokens_right, token_nll, LossOptions};
use crate::marginalize::{marginalize_tokens, queries_for_rows};
use crate::model::{RagInputs, RagModel};
use crate::sampling::BanRules;

pub struct RagTokenForGeneration {
    rag: RagModel,
}

impl RagTokenForGeneration {
    pub fn new(rag: RagModel) -> Self {
        Self { rag }
    }

    /// Document-marginalized log-probabilities `[batch, t, vocab]` from
    /// per-document logits `[batch * n_docs, t, vocab]`.
    pub fn marginalize(&self, seq_logits: &Tensor, doc_scores: &Tensor, n_docs: Option<usize>) -> Result<Tensor> {
        marginalize_tokens(seq_logits, doc_scores, self.rag.n_docs(n_docs))
    }

    pub fn get_nll(
        &self,
        seq_logits: &Tensor,
        doc_scores: &Tensor,
        target: &Tensor,
        reduce_loss: bool,
        epsilon: f64,
        n_docs: Option<usize>,
    ) -> Result<Tensor> {
        let tokens = &self.rag.config().tokens;
        let opts = LossOptions {
            n_docs: self.rag.n_docs(n_docs),
            pad_token_id: tokens.pad_token_id,
            bos_token_id: tokens.bos_token_id,
            epsilon,
            reduce_loss,
            exclude_bos_score: false,
        };
        token_nll(seq_logits, doc_scores, target, &opts)
    }

    /// Decoder inputs for teacher forcing, built from `i64` labels.
    pub fn shift_tokens_right(&self, labels: &Tensor, start_token_id: Option<u32>) -> Result<Tensor> {
        let tokens = &self.rag.config().tokens;
        shift_tokens_right(
            labels,
            start_token_id.unwrap_or(tokens.decoder_start_token_id),
            tokens.pad_token_id,
        )
    }

    /// Encode the contexts and lay every tensor out as `(batch, beam, doc)`
    /// rows for the step loop.
    fn prepare_decode(&self, request: &GenerateRequest) -> Result<(DecodeInputs, DecodeState)> {
        let config = self.rag.config();
        let params = request.params.clone().unwrap_or_else(|| config.generation.clone());
        params.validate()?;
        params.validate_return_sequences(params.num_beams)?;
        let n_docs = self.rag.n_docs(request.n_docs);

        let context = self
            .rag
            .resolve_context(&request.rag_inputs(n_docs), n_docs, false)?;
        let context_input_ids = context
            .context_input_ids
            .as_ref()
            .ok_or(RagError::MissingContext("context_input_ids"))?;
        let batch = queries_for_rows(context_input_ids.dim(0)?, n_docs)?;
        let num_beams = params.num_beams;

        let generator = self.rag.generator();
        let encoder = generator.encode(context_input_ids, context.context_attention_mask.as_ref())?;
        let hidden_states = expand_for_beams(&encoder.hidden_states, batch, num_beams, n_docs)?;
        let attention_mask = context
            .context_attention_mask
            .as_ref()
            .map(|mask| expand_for_beams(mask, batch, num_beams, n_docs))
            .transpose()?;
        let doc_scores = repeat_interleave(&context.doc_scores, num_beams)?;

        tracing::info!(
            mode = if params.is_beam_search() { "beam" } else { "no_beam" },
            batch,
            n_docs,
            num_beams,
            max_length = params.max_length,
            "rag-token generate"
        );

        let cache = GenerationCache::new(EncoderState::new(hidden_states), n_docs);
        let state = DecodeState::new(
            config.tokens.decoder_start_token_id,
            batch * num_beams,
            cache,
            attention_mask,
        );
        let inputs = DecodeInputs {
            rules: BanRules::from_config(&params, config.tokens.eos_token_id),
            params,
            tokens: config.tokens.clone(),
            doc_scores,
            n_docs,
            batch,
            vocab_size: generator.vocab_size(),
        };
        Ok((inputs, state))
    }
}

impl DecodeStep for RagTokenForGeneration {
    /// Feed the newest token per row (the whole history when no decoder
    /// cache is kept), repeated across documents, and marginalize the last
    /// position.
    fn next_token_scores(&self, inputs: &DecodeInputs, state: &DecodeState) -> Result<StepOutput> {
        let use_past = inputs.params.use_cache && state.cache.has_history();
        let width = if use_past { 1 } else { state.cur_len };
        let rows = state.sequences.len();
        let ids: Vec<u32> = state
            .sequences
            .iter()
            .flat_map(|seq| seq[seq.len() - width..].iter().copied())
            .collect();
        let device = state.cache.encoder().device();
        let ids = Tensor::from_vec(ids, (rows, width), device)?;
        let ids = repeat_interleave(&ids, inputs.n_docs)?;

        let past = if use_past { state.cache.decoder() } else { None };
        let output = self.rag.generator().decode_step(
            &ids,
            state.cache.encoder(),
            state.attention_mask.as_ref(),
            past,
        )?;

        let (_, t, _) = output.logits.dims3()?;
        let last = output.logits.narrow(1, t - 1, 1)?;
        let scores = marginalize_tokens(&last, &inputs.doc_scores, inputs.n_docs)?.squeeze(1)?;
        let past = if inputs.params.use_cache { output.past } else { None };
        Ok(StepOutput { scores, past })
    }

    fn adjust_logits(&self, logits: Tensor, cur_len: usize, max_length: usize) -> Result<Tensor> {
        Ok(self
            .rag
            .generator()
            .adjust_logits_during_generation(logits, cur_len, max_length)?)
    }

    fn is_encoder_decoder(&self) -> bool {
        self.rag.generator().is_encoder_decoder()
    }
}

impl RagGeneration for RagTokenForGeneration {
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
        let do_marginalize = options.do_marginalize.unwrap_or(config.do_marginalize);
        let reduce_loss = options.reduce_loss.unwrap_or(config.reduce_loss);

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
                    Some(n_docs),
                )
            })
            .transpose()?;
        let logits = if do_marginalize {
            self.marginalize(&output.logits, &output.doc_scores, Some(n_docs))?
        } else {
            output.logits
        };
        let output_retrieved = config.output_retrieved;
        Ok(RagLmOutput {
            loss,
            logits,
            doc_scores: output.doc_scores,
            past: output.past,
            context_input_ids: output.context_input_ids.filter(|_| output_retrieved),
            context_attention_mask: output.context_attention_mask.filter(|_| output_retrieved),
            retrieved: output.retrieved.filter(|_| output_retrieved),
        })
    }

    fn generate(&self, request: GenerateRequest) -> Result<Tensor> {
        let (inputs, state) = self.prepare_decode(&request)?;
        if inputs.params.is_beam_search() {
            beam_search::generate(self, &inputs, state)
        } else {
            no_beam::generate(self, &inputs, state)
        }
    }
}
