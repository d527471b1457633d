//! Greedy and sampling decode loop for RAG-Token.

use candle_core::Tensor;

use super::{DecodeInputs, DecodeState, DecodeStep};
use crate::error::Result;
use crate::cache::LayerCache;
use crate::layout::{pad_rows, stack_rows};
use crate::sampling::{
    apply_ban_mask, argmax, sample_from_logits, top_k_top_p_filter, LogitsProcessor,
    RepetitionPenaltyProcessor, SamplerState, TemperatureProcessor,
};

/// Decode state of the no-beam loop.
#[derive(Debug, Clone)]
pub struct NoBeamState {
    pub decode: DecodeState,
    pub unfinished: Vec<bool>,
    /// Length at which each row emitted EOS (`max_length` while unfinished).
    pub sent_lengths: Vec<usize>,
}

impl NoBeamState {
    pub fn new(decode: DecodeState, max_length: usize) -> Self {
        let rows = decode.sequences.len();
        Self {
            decode,
            unfinished: vec![true; rows],
            sent_lengths: vec![max_length; rows],
        }
    }

    pub fn all_finished(&self) -> bool {
        self.unfinished.iter().all(|u| !u)
    }
}

/// Pick the next token for every row after penalties, bans and sampling.
pub fn select_tokens(
    model: &impl DecodeStep,
    inputs: &DecodeInputs,
    state: &NoBeamState,
    sampler: &mut SamplerState,
) -> Result<(Vec<u32>, Option<Vec<LayerCache>>)> {
    let params = &inputs.params;
    let decode = &state.decode;
    let step = model.next_token_scores(inputs, decode)?;
    let device = step.scores.device().clone();

    let mut scores = step.scores;
    if params.repetition_penalty != 1.0 {
        let penalty = RepetitionPenaltyProcessor::new(params.repetition_penalty);
        let mut rows = scores.to_vec2::<f32>()?;
        for (row, generated) in rows.iter_mut().zip(decode.sequences.iter()) {
            penalty.process(row, generated);
        }
        scores = stack_rows(&rows, &device)?;
    }
    if !inputs.rules.is_empty() {
        let mask = inputs.rules.ban_mask(&decode.sequences, decode.cur_len, inputs.vocab_size, 1, &device)?;
        scores = apply_ban_mask(&scores, &mask)?;
    }

    let rows = scores.to_vec2::<f32>()?;
    let mut next_tokens = Vec::with_capacity(rows.len());
    for (mut row, generated) in rows.into_iter().zip(decode.sequences.iter()) {
        let token = if params.do_sample {
            if params.temperature != 1.0 {
                TemperatureProcessor::new(params.temperature).process(&mut row, generated);
            }
            top_k_top_p_filter(&mut row, params.top_k, params.top_p, 1);
            sample_from_logits(&row, sampler.rng_mut())
        } else {
            argmax(&row)
        };
        next_tokens.push(token);
    }
    Ok((next_tokens, step.past))
}

/// Advance every row by one token. Finished rows receive the pad token.
pub fn advance(
    model: &impl DecodeStep,
    inputs: &DecodeInputs,
    state: NoBeamState,
    sampler: &mut SamplerState,
) -> Result<NoBeamState> {
    let (next_tokens, past) = select_tokens(model, inputs, &state, sampler)?;
    let NoBeamState {
        decode,
        mut unfinished,
        mut sent_lengths,
    } = state;
    let DecodeState {
        mut sequences,
        cur_len,
        cache,
        attention_mask,
    } = decode;

    let cur_len = cur_len + 1;
    for (row, &token) in next_tokens.iter().enumerate() {
        let to_add = if unfinished[row] {
            token
        } else {
            inputs.tokens.pad_token_id
        };
        sequences[row].push(to_add);
        if unfinished[row] && Some(token) == inputs.tokens.eos_token_id {
            sent_lengths[row] = cur_len;
            unfinished[row] = false;
        }
    }

    let mut decode = DecodeState {
        sequences,
        cur_len,
        cache: cache.with_decoder(past),
        attention_mask,
    };
    if !model.is_encoder_decoder() {
        decode = decode.grow_attention_mask()?;
    }
    Ok(NoBeamState {
        decode,
        unfinished,
        sent_lengths,
    })
}

/// Run the loop until every row has emitted EOS or `max_length` is reached.
/// Returns `[rows, len]` token ids.
pub fn generate(model: &impl DecodeStep, inputs: &DecodeInputs, decode: DecodeState) -> Result<Tensor> {
    let max_length = inputs.params.max_length;
    let mut sampler = SamplerState::new(inputs.params.seed);
    let mut state = NoBeamState::new(decode, max_length);

    while state.decode.cur_len < max_length {
        state = advance(model, inputs, state, &mut sampler)?;
        tracing::debug!(
            cur_len = state.decode.cur_len,
            unfinished = state.unfinished.iter().filter(|u| **u).count(),
            "no-beam step"
        );
        if state.all_finished() {
            break;
        }
    }

    let width = state.decode.cur_len;
    let pad = inputs.tokens.pad_token_id;
    let min_len = state.sent_lengths.iter().copied().min().unwrap_or(width);
    let max_len = state.sent_lengths.iter().copied().max().unwrap_or(width);
    let mut rows = state.decode.sequences;
    if min_len != max_len {
        for (row, &len) in rows.iter_mut().zip(state.sent_lengths.iter()) {
            for token in row.iter_mut().skip(len) {
                *token = pad;
            }
        }
    }
    pad_rows(&rows, width, pad, state.decode.cache.encoder().device())
}
