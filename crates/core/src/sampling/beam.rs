//! Beam search bookkeeping.
//!
//! [`BeamHypotheses`] keeps the best finished sequences of one batch element;
//! [`top_candidates`] ranks the flattened (beam × vocab) scores of a batch
//! element at each step.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A finished sequence and its length-normalized score.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamHypothesis {
    pub token_ids: Vec<u32>,
    pub score: f32,
}

/// Length-normalized score: `sum_logprobs / len^length_penalty`.
pub fn length_normalized(sum_logprobs: f32, len: usize, length_penalty: f32) -> f32 {
    sum_logprobs / (len as f32).powf(length_penalty)
}

/// Bounded store of finished hypotheses for one batch element.
///
/// Holds at most `num_beams` entries; adding to a full store evicts the worst
/// entry when the newcomer beats it.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    beams: Vec<BeamHypothesis>,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            num_beams,
            length_penalty,
            early_stopping,
            beams: Vec::with_capacity(num_beams + 1),
            worst_score: 1e9,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// Score of the weakest stored hypothesis (`1e9` while empty).
    pub fn worst_score(&self) -> f32 {
        self.worst_score
    }

    pub fn hypotheses(&self) -> &[BeamHypothesis] {
        &self.beams
    }

    /// Insert a finished sequence scored by its summed log-probabilities.
    pub fn add(&mut self, token_ids: Vec<u32>, sum_logprobs: f32) {
        let score = length_normalized(sum_logprobs, token_ids.len(), self.length_penalty);
        if self.beams.len() < self.num_beams || score > self.worst_score {
            self.beams.push(BeamHypothesis { token_ids, score });
            if self.beams.len() > self.num_beams {
                let worst_idx = self.worst_index();
                self.beams.remove(worst_idx);
                self.worst_score = self
                    .beams
                    .iter()
                    .map(|h| h.score)
                    .fold(f32::INFINITY, f32::min);
            } else {
                self.worst_score = self.worst_score.min(score);
            }
        }
    }

    fn worst_index(&self) -> usize {
        self.beams
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Whether no live beam can still improve this store.
    ///
    /// `best_sum_logprobs` is the highest cumulative score among the batch
    /// element's candidates at `cur_len`.
    pub fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        let cur_score = length_normalized(best_sum_logprobs, cur_len, self.length_penalty);
        self.worst_score >= cur_score
    }

    /// Remove and return the best `n` hypotheses, highest score first.
    pub fn take_best(&mut self, n: usize) -> Vec<BeamHypothesis> {
        self.beams
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        let n = n.min(self.beams.len());
        let best: Vec<BeamHypothesis> = self.beams.drain(..n).collect();
        self.worst_score = self
            .beams
            .iter()
            .map(|h| h.score)
            .fold(1e9, f32::min);
        best
    }
}

/// One entry of a batch element's flattened (beam × vocab) score row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamCandidate {
    /// Index into the flattened row: `beam * vocab_size + token`.
    pub flat_index: usize,
    pub score: f32,
}

impl BeamCandidate {
    pub fn beam(&self, vocab_size: usize) -> usize {
        self.flat_index / vocab_size
    }

    pub fn token(&self, vocab_size: usize) -> u32 {
        (self.flat_index % vocab_size) as u32
    }
}

impl Eq for BeamCandidate {}

impl PartialOrd for BeamCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BeamCandidate {
    // Reversed so the heap top is the weakest kept candidate. Equal scores
    // rank the lower index as weaker, so ties favor the later index.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.flat_index.cmp(&self.flat_index))
    }
}

/// The `k` highest scores of `scores`, best first.
///
/// Ties are broken deterministically in favor of the later index.
pub fn top_candidates(scores: &[f32], k: usize) -> Vec<BeamCandidate> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<BeamCandidate> = BinaryHeap::with_capacity(k + 1);
    for (flat_index, &score) in scores.iter().enumerate() {
        heap.push(BeamCandidate { flat_index, score });
        if heap.len() > k {
            heap.pop();
        }
    }
    // Ascending under the reversed ordering means best first.
    heap.into_sorted_vec()
}
