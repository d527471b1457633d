//! Beam search decode loop for RAG-Token.
//!
//! Each step ranks the top `2 * num_beams` (beam, token) candidates of every
//! batch element. EOS candidates within the first `num_beams` ranks are
//! finalized into that element's [`BeamHypotheses`]; the others extend live
//! beams until `num_beams` continuations are chosen.

use std::ops::ControlFlow;

use candle_core::{Tensor, D};
use candle_nn::ops::log_softmax;

use super::{DecodeInputs, DecodeState, DecodeStep};
use crate::error::Result;
use crate::layout::{pad_rows, stack_rows};
use crate::sampling::{
    apply_ban_mask, sample_without_replacement, top_candidates, top_k_top_p_filter, BeamCandidate,
    BeamHypotheses, LogitsProcessor, RepetitionPenaltyProcessor, SamplerState, TemperatureProcessor,
};

/// Score given to beams that exist only to keep the beam count constant.
const FILLER_SCORE: f32 = -1e9;

/// One selected continuation: cumulative score, token, parent row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamSlot {
    pub score: f32,
    pub token: u32,
    pub parent_row: usize,
}

/// Decode state of the beam loop.
#[derive(Debug, Clone)]
pub struct BeamState {
    pub decode: DecodeState,
    /// Cumulative log-probability per (batch, beam) row.
    pub beam_scores: Vec<f32>,
    pub done: Vec<bool>,
    pub hypotheses: Vec<BeamHypotheses>,
}

impl BeamState {
    /// Greedy search starts with only the first beam of each element live so
    /// step one does not pick `num_beams` copies of the best token.
    pub fn new(decode: DecodeState, inputs: &DecodeInputs) -> Self {
        let params = &inputs.params;
        let num_beams = params.num_beams;
        let mut beam_scores = vec![0.0f32; inputs.batch * num_beams];
        if !params.do_sample {
            for (i, score) in beam_scores.iter_mut().enumerate() {
                if i % num_beams != 0 {
                    *score = FILLER_SCORE;
                }
            }
        }
        Self {
            decode,
            beam_scores,
            done: vec![false; inputs.batch],
            hypotheses: (0..inputs.batch)
                .map(|_| BeamHypotheses::new(num_beams, params.length_penalty, params.early_stopping))
                .collect(),
        }
    }
}

/// Per-row log-probabilities after penalties, temperature, the generator's
/// logit hook and token bans, `[rows, vocab]`.
pub fn step_scores(model: &impl DecodeStep, inputs: &DecodeInputs, decode: &DecodeState, logits: Tensor) -> Result<Tensor> {
    let params = &inputs.params;
    let device = logits.device().clone();
    let mut logits = logits;
    if params.repetition_penalty != 1.0 || params.temperature != 1.0 {
        let mut rows = logits.to_vec2::<f32>()?;
        let penalty = RepetitionPenaltyProcessor::new(params.repetition_penalty);
        let temperature = TemperatureProcessor::new(params.temperature);
        for (row, generated) in rows.iter_mut().zip(decode.sequences.iter()) {
            if params.repetition_penalty != 1.0 {
                penalty.process(row, generated);
            }
            if params.temperature != 1.0 {
                temperature.process(row, generated);
            }
        }
        logits = stack_rows(&rows, &device)?;
    }
    if model.is_encoder_decoder() && !params.do_sample {
        logits = model.adjust_logits(logits, decode.cur_len, params.max_length)?;
    }
    let scores = log_softmax(&logits, D::Minus1)?;
    if inputs.rules.is_empty() {
        return Ok(scores);
    }
    let mask = inputs
        .rules
        .ban_mask(&decode.sequences, decode.cur_len, inputs.vocab_size, params.num_beams, &device)?;
    apply_ban_mask(&scores, &mask)
}

/// Rank the `2 * num_beams` best candidates of every batch element, best
/// first. `scores` already include each beam's cumulative score.
pub fn rank_candidates(scores: &[Vec<f32>], inputs: &DecodeInputs, sampler: &mut SamplerState) -> Vec<Vec<BeamCandidate>> {
    let params = &inputs.params;
    let num_beams = params.num_beams;
    let k = 2 * num_beams;
    scores
        .chunks(num_beams)
        .map(|element| {
            let mut flat: Vec<f32> = Vec::with_capacity(num_beams * inputs.vocab_size);
            for row in element {
                flat.extend_from_slice(row);
            }
            if params.do_sample {
                for row in flat.chunks_mut(inputs.vocab_size) {
                    top_k_top_p_filter(row, params.top_k, params.top_p, 2);
                }
                let mut drawn: Vec<BeamCandidate> = sample_without_replacement(&flat, k, sampler.rng_mut())
                    .into_iter()
                    .map(|flat_index| BeamCandidate {
                        flat_index,
                        score: flat[flat_index],
                    })
                    .collect();
                // Candidate ordering is reversed: ascending means best first.
                drawn.sort();
                drawn
            } else {
                top_candidates(&flat, k)
            }
        })
        .collect()
}

/// Walk one batch element's candidates, finalizing EOS candidates in the top
/// `num_beams` ranks and collecting `num_beams` live continuations.
pub fn select_beams(
    batch_idx: usize,
    candidates: &[BeamCandidate],
    sequences: &[Vec<u32>],
    hypotheses: &mut BeamHypotheses,
    inputs: &DecodeInputs,
) -> Vec<BeamSlot> {
    let num_beams = inputs.params.num_beams;
    let vocab_size = inputs.vocab_size;
    let mut slots = Vec::with_capacity(num_beams);
    for (rank, candidate) in candidates.iter().enumerate() {
        let token = candidate.token(vocab_size);
        let parent_row = batch_idx * num_beams + candidate.beam(vocab_size);
        if Some(token) == inputs.tokens.eos_token_id {
            if rank >= num_beams {
                continue;
            }
            hypotheses.add(sequences[parent_row].clone(), candidate.score);
        } else {
            slots.push(BeamSlot {
                score: candidate.score,
                token,
                parent_row,
            });
        }
        if slots.len() == num_beams {
            break;
        }
    }
    if slots.len() < num_beams {
        tracing::warn!(
            batch_idx,
            selected = slots.len(),
            num_beams,
            "too few beam candidates; padding with filler beams"
        );
        slots.resize(
            num_beams,
            BeamSlot {
                score: FILLER_SCORE,
                token: inputs.tokens.pad_token_id,
                parent_row: batch_idx * num_beams,
            },
        );
    }
    slots
}

/// One beam step. Breaks once every batch element is done; the returned
/// state then still holds the sequences of the previous step.
pub fn advance(
    model: &impl DecodeStep,
    inputs: &DecodeInputs,
    state: BeamState,
    sampler: &mut SamplerState,
) -> Result<ControlFlow<BeamState, BeamState>> {
    let num_beams = inputs.params.num_beams;
    let step = model.next_token_scores(inputs, &state.decode)?;
    let scores = step_scores(model, inputs, &state.decode, step.scores)?;

    let mut rows = scores.to_vec2::<f32>()?;
    for (row, &beam_score) in rows.iter_mut().zip(state.beam_scores.iter()) {
        for s in row.iter_mut() {
            *s += beam_score;
        }
    }
    let ranked = rank_candidates(&rows, inputs, sampler);

    let BeamState {
        decode,
        beam_scores,
        mut done,
        mut hypotheses,
    } = state;

    let mut next_beams: Vec<BeamSlot> = Vec::with_capacity(inputs.batch * num_beams);
    for (batch_idx, candidates) in ranked.iter().enumerate() {
        if done[batch_idx] {
            next_beams.extend(std::iter::repeat(BeamSlot {
                score: 0.0,
                token: inputs.tokens.pad_token_id,
                parent_row: batch_idx * num_beams,
            }).take(num_beams));
            continue;
        }
        let slots = select_beams(
            batch_idx,
            candidates,
            &decode.sequences,
            &mut hypotheses[batch_idx],
            inputs,
        );
        next_beams.extend(slots);
        let best = candidates.first().map(|c| c.score).unwrap_or(f32::NEG_INFINITY);
        done[batch_idx] = hypotheses[batch_idx].is_done(best, decode.cur_len);
    }

    if done.iter().all(|d| *d) {
        return Ok(ControlFlow::Break(BeamState {
            decode,
            beam_scores,
            done,
            hypotheses,
        }));
    }

    let beam_idx: Vec<u32> = next_beams.iter().map(|s| s.parent_row as u32).collect();
    let sequences = next_beams
        .iter()
        .map(|slot| {
            let mut seq = decode.sequences[slot.parent_row].clone();
            seq.push(slot.token);
            seq
        })
        .collect();
    let cache = decode.cache.with_decoder(step.past).reorder(&beam_idx)?;
    let mut decode = DecodeState {
        sequences,
        cur_len: decode.cur_len + 1,
        cache,
        attention_mask: decode.attention_mask,
    };
    if !model.is_encoder_decoder() {
        decode = decode.grow_attention_mask()?;
    }
    Ok(ControlFlow::Continue(BeamState {
        decode,
        beam_scores: next_beams.iter().map(|s| s.score).collect(),
        done,
        hypotheses,
    }))
}

/// Flush live beams, pick the best `num_return_sequences` per element and
/// right-pad, placing EOS after every hypothesis shorter than `max_length`.
pub fn finalize(state: BeamState, inputs: &DecodeInputs) -> Result<Tensor> {
    let params = &inputs.params;
    let num_beams = params.num_beams;
    let BeamState {
        decode,
        beam_scores,
        done,
        mut hypotheses,
    } = state;

    for (batch_idx, hyps) in hypotheses.iter_mut().enumerate() {
        if done[batch_idx] {
            continue;
        }
        for beam in 0..num_beams {
            let row = batch_idx * num_beams + beam;
            hyps.add(decode.sequences[row].clone(), beam_scores[row]);
        }
    }

    let best: Vec<Vec<u32>> = hypotheses
        .iter_mut()
        .flat_map(|hyps| hyps.take_best(params.num_return_sequences))
        .map(|h| h.token_ids)
        .collect();

    let longest = best.iter().map(Vec::len).max().unwrap_or(0);
    let width = longest.max((longest + 1).min(params.max_length));
    let mut rows = Vec::with_capacity(best.len());
    for mut hypo in best {
        if hypo.len() < params.max_length {
            if let Some(eos) = inputs.tokens.eos_token_id {
                hypo.push(eos);
            }
        }
        rows.push(hypo);
    }
    pad_rows(&rows, width, inputs.tokens.pad_token_id, decode.cache.encoder().device())
}

pub fn generate(model: &impl DecodeStep, inputs: &DecodeInputs, decode: DecodeState) -> Result<Tensor> {
    let max_length = inputs.params.max_length;
    let mut sampler = SamplerState::new(inputs.params.seed);
    let mut state = BeamState::new(decode, inputs);

    while state.decode.cur_len < max_length {
        match advance(model, inputs, state, &mut sampler)? {
            ControlFlow::Continue(next) => state = next,
            ControlFlow::Break(last) => {
                tracing::debug!(cur_len = last.decode.cur_len, "every batch element is done");
                state = last;
                break;
            }
        }
        tracing::debug!(
            cur_len = state.decode.cur_len,
            done = state.done.iter().filter(|d| **d).count(),
            "beam step"
        );
    }
    finalize(state, inputs)
}
