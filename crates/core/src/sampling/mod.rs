//! Token selection for the decoders.
//!
//! This module provides:
//! - Seeded sampler state shared by one decode call
//! - Top-k / nucleus filtering on logit rows
//! - Arg-max, categorical sampling and sampling without replacement
//! - Logit processors and ban rules ([`logits_processor`])
//! - Beam bookkeeping ([`beam`])

pub mod beam;
pub mod logits_processor;

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub use beam::{top_candidates, BeamCandidate, BeamHypotheses, BeamHypothesis};
pub use logits_processor::{
    apply_ban_mask, BadWordsBan, BanRules, LogitsProcessor, MinLengthBan, NoRepeatNGramBan,
    RepetitionPenaltyProcessor, TemperatureProcessor, TokenBan,
};

/// Mutable RNG state for one decode call.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Index of the largest value; ties resolve to the later index.
pub fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Mask logits outside the top-k and outside the nucleus of mass `top_p` to
/// `-inf`, always keeping at least `min_tokens_to_keep` entries.
///
/// `top_k == 0` and `top_p >= 1.0` disable the respective filter.
pub fn top_k_top_p_filter(logits: &mut [f32], top_k: usize, top_p: f32, min_tokens_to_keep: usize) {
    let vocab_size = logits.len();
    if vocab_size == 0 {
        return;
    }
    if top_k > 0 {
        let k = top_k.max(min_tokens_to_keep).min(vocab_size);
        let mut sorted: Vec<f32> = logits.to_vec();
        sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let threshold = sorted[k - 1];
        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
    if top_p < 1.0 {
        let mut order: Vec<usize> = (0..vocab_size).collect();
        order.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal));
        let sorted_logits: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
        let probs = softmax(&sorted_logits);
        let mut cumulative = 0.0f32;
        let mut remove = vec![false; vocab_size];
        for (rank, p) in probs.iter().enumerate() {
            cumulative += p;
            remove[rank] = cumulative > top_p;
        }
        // Shift right so the token crossing the threshold is kept.
        for rank in (1..vocab_size).rev() {
            remove[rank] = remove[rank - 1];
        }
        remove[0] = false;
        for flag in remove.iter_mut().take(min_tokens_to_keep.min(vocab_size)) {
            *flag = false;
        }
        for (rank, &idx) in order.iter().enumerate() {
            if remove[rank] {
                logits[idx] = f32::NEG_INFINITY;
            }
        }
    }
}

/// Draw one index from the categorical distribution `softmax(logits)`.
pub fn sample_from_logits(logits: &[f32], rng: &mut StdRng) -> u32 {
    let probs = softmax(logits);
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0u32;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i as u32;
        }
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    last_nonzero
}

/// Draw `k` distinct indices from `softmax(logits)` using the Gumbel top-k
/// trick. Indices with `-inf` logits are drawn only once every finite one
/// has been taken.
pub fn sample_without_replacement(logits: &[f32], k: usize, rng: &mut StdRng) -> Vec<usize> {
    let perturbed: Vec<f32> = logits
        .iter()
        .map(|&l| {
            let u: f32 = rng.gen_range(f32::EPSILON..1.0);
            l - (-u.ln()).ln()
        })
        .collect();
    top_candidates(&perturbed, k)
        .into_iter()
        .map(|c| c.flat_index)
        .collect()
}
