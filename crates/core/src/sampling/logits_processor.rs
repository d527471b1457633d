//! Logit transformations and token bans applied at every decode step.
//!
//! Score processors ([`LogitsProcessor`]) rewrite a row of logits in place.
//! Ban rules ([`TokenBan`]) only name tokens that must not be produced next;
//! [`BanRules`] turns them into a `u8` mask tensor that is applied with
//! `where_cond`, so the mask itself can be inspected.

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::config::GenerationConfig;
use crate::error::Result;

/// Trait for logit transformations applied before sampling or ranking.
pub trait LogitsProcessor: Send + Sync {
    /// Apply this processor's transformation to one row of logits.
    fn process(&self, logits: &mut [f32], generated_tokens: &[u32]);

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str;
}

/// CTRL-style repetition penalty over the distinct previously generated
/// tokens: negative logits are multiplied by the penalty, positive ones
/// divided. A zero logit is unchanged.
pub struct RepetitionPenaltyProcessor {
    penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn process(&self, logits: &mut [f32], generated_tokens: &[u32]) {
        let mut seen = vec![false; logits.len()];
        for &token_id in generated_tokens {
            let idx = token_id as usize;
            if idx >= logits.len() || seen[idx] {
                continue;
            }
            seen[idx] = true;
            if logits[idx] < 0.0 {
                logits[idx] *= self.penalty;
            } else {
                logits[idx] /= self.penalty;
            }
        }
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

pub struct TemperatureProcessor {
    temperature: f32,
}

impl TemperatureProcessor {
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }
}

impl LogitsProcessor for TemperatureProcessor {
    fn process(&self, logits: &mut [f32], _generated_tokens: &[u32]) {
        let inv_temp = 1.0 / self.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }

    fn name(&self) -> &'static str {
        "temperature"
    }
}

/// A rule naming tokens that may not be generated next.
pub trait TokenBan: Send + Sync {
    /// Tokens banned for a row whose history is `generated` (of length
    /// `cur_len`, start token included).
    fn banned_tokens(&self, generated: &[u32], cur_len: usize) -> Vec<u32>;

    fn name(&self) -> &'static str;
}

/// Bans any token that would complete an n-gram already present in the row.
pub struct NoRepeatNGramBan {
    ngram_size: usize,
}

impl NoRepeatNGramBan {
    pub fn new(ngram_size: usize) -> Self {
        Self { ngram_size }
    }
}

impl TokenBan for NoRepeatNGramBan {
    fn banned_tokens(&self, generated: &[u32], cur_len: usize) -> Vec<u32> {
        let n = self.ngram_size;
        if n == 0 || cur_len + 1 < n || generated.len() < cur_len {
            return Vec::new();
        }
        let history = &generated[..cur_len];
        let mut followers: HashMap<&[u32], Vec<u32>> = HashMap::new();
        for ngram in history.windows(n) {
            followers.entry(&ngram[..n - 1]).or_default().push(ngram[n - 1]);
        }
        let prefix = &history[cur_len + 1 - n..];
        followers.get(prefix).cloned().unwrap_or_default()
    }

    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }
}

/// Bans single-token bad words unconditionally and the last token of a
/// multi-token bad word whenever the row ends with the rest of it.
pub struct BadWordsBan {
    bad_words_ids: Vec<Vec<u32>>,
}

impl BadWordsBan {
    pub fn new(bad_words_ids: Vec<Vec<u32>>) -> Self {
        Self { bad_words_ids }
    }
}

impl TokenBan for BadWordsBan {
    fn banned_tokens(&self, generated: &[u32], _cur_len: usize) -> Vec<u32> {
        self.bad_words_ids
            .iter()
            .filter_map(|word| {
                let (&last, prefix) = word.split_last()?;
                generated.ends_with(prefix).then_some(last)
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "bad_words"
    }
}

/// Bans EOS while the sequence is shorter than `min_length`.
pub struct MinLengthBan {
    min_length: usize,
    eos_token_id: u32,
}

impl MinLengthBan {
    pub fn new(min_length: usize, eos_token_id: u32) -> Self {
        Self {
            min_length,
            eos_token_id,
        }
    }
}

impl TokenBan for MinLengthBan {
    fn banned_tokens(&self, _generated: &[u32], cur_len: usize) -> Vec<u32> {
        if cur_len < self.min_length {
            vec![self.eos_token_id]
        } else {
            Vec::new()
        }
    }

    fn name(&self) -> &'static str {
        "min_length"
    }
}

/// Ordered set of ban rules for one decode call.
#[derive(Default)]
pub struct BanRules {
    rules: Vec<Box<dyn TokenBan>>,
}

impl BanRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// N-gram, bad-word and min-length rules, in that order.
    pub fn from_config(params: &GenerationConfig, eos_token_id: Option<u32>) -> Self {
        let mut rules = Self::new();
        if params.no_repeat_ngram_size > 0 {
            rules.push(NoRepeatNGramBan::new(params.no_repeat_ngram_size));
        }
        if let Some(bad_words) = &params.bad_words_ids {
            if !bad_words.is_empty() {
                rules.push(BadWordsBan::new(bad_words.clone()));
            }
        }
        if let Some(eos) = eos_token_id {
            if params.min_length > 0 {
                rules.push(MinLengthBan::new(params.min_length, eos));
            }
        }
        rules
    }

    pub fn push(&mut self, rule: impl TokenBan + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Row-major ban flags, `sequences.len() * vocab_size` entries.
    ///
    /// A rule whose bans would leave fewer than `min_unbanned` tokens in a
    /// row is skipped for that row so every row keeps enough candidates.
    pub fn banned_flags(&self, sequences: &[Vec<u32>], cur_len: usize, vocab_size: usize, min_unbanned: usize) -> Vec<u8> {
        let mut flags = vec![0u8; sequences.len() * vocab_size];
        for (row, generated) in sequences.iter().enumerate() {
            let row_flags = &mut flags[row * vocab_size..(row + 1) * vocab_size];
            let mut banned_count = 0usize;
            for rule in &self.rules {
                let mut fresh: Vec<usize> = rule
                    .banned_tokens(generated, cur_len)
                    .into_iter()
                    .map(|t| t as usize)
                    .filter(|&t| t < vocab_size && row_flags[t] == 0)
                    .collect();
                fresh.sort_unstable();
                fresh.dedup();
                if vocab_size - banned_count - fresh.len() < min_unbanned {
                    tracing::warn!(
                        rule = rule.name(),
                        row,
                        cur_len,
                        "ban rule would leave too few tokens; skipping it for this row"
                    );
                    continue;
                }
                for t in fresh {
                    row_flags[t] = 1;
                    banned_count += 1;
                }
            }
        }
        flags
    }

    /// Ban mask as a `u8` tensor of shape `[rows, vocab_size]`; 1 marks a
    /// banned token.
    pub fn ban_mask(
        &self,
        sequences: &[Vec<u32>],
        cur_len: usize,
        vocab_size: usize,
        min_unbanned: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let flags = self.banned_flags(sequences, cur_len, vocab_size, min_unbanned);
        Ok(Tensor::from_vec(flags, (sequences.len(), vocab_size), device)?)
    }
}

/// Set banned entries of `scores` to `-inf`.
pub fn apply_ban_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.shape(), scores.device())?;
    Ok(mask.where_cond(&neg_inf, scores)?)
}
