//! Document-marginalized negative log-likelihood.
//!
//! Both losses score position `i` of the decoder output against target token
//! `i + 1`, mask pad positions to zero and blend in a uniform label-smoothing
//! term weighted by `epsilon`.

use candle_core::{DType, Tensor};

use crate::error::{RagError, Result};
use crate::marginalize::{marginalize_sequences, marginalize_tokens, queries_for_rows, sequence_logprobs};

/// Label value excluded from the loss by convention.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossOptions {
    pub n_docs: usize,
    pub pad_token_id: u32,
    pub bos_token_id: Option<u32>,
    /// Label smoothing weight.
    pub epsilon: f64,
    /// Sum per-example losses into a scalar.
    pub reduce_loss: bool,
    /// Sequence loss only: drop the first target token's score when every
    /// target in the batch starts with BOS.
    pub exclude_bos_score: bool,
}

/// Drop the first target column and right-pad with `pad_token_id`.
pub fn shift_targets_left(target: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let (batch, t) = target.dims2()?;
    let pad = Tensor::full(pad_token_id, (batch, 1), target.device())?;
    if t <= 1 {
        return Ok(Tensor::full(pad_token_id, (batch, t), target.device())?);
    }
    let rest = target.narrow(1, 1, t - 1)?.to_dtype(DType::U32)?;
    Ok(Tensor::cat(&[&rest, &pad], 1)?)
}

/// Build decoder inputs from labels: prepend `decoder_start_token_id`, drop
/// the last column and replace [`IGNORE_INDEX`] with the pad token.
///
/// `labels` is an `i64` tensor of shape `[batch, t]`; the result is `u32`.
pub fn shift_tokens_right(labels: &Tensor, decoder_start_token_id: u32, pad_token_id: u32) -> Result<Tensor> {
    let (batch, t) = labels.dims2()?;
    let rows = labels.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let mut shifted = Vec::with_capacity(batch * t);
    for row in &rows {
        if t == 0 {
            break;
        }
        shifted.push(decoder_start_token_id);
        for &label in &row[..t - 1] {
            let token = match label {
                IGNORE_INDEX => pad_token_id,
                l if l < 0 => {
                    return Err(RagError::InvalidParams(format!("negative label {l} in labels")));
                }
                l => l as u32,
            };
            shifted.push(token);
        }
    }
    Ok(Tensor::from_vec(shifted, (batch, t), labels.device())?)
}

fn pad_positions(target: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let pad = Tensor::full(pad_token_id, target.shape(), target.device())?;
    Ok(target.eq(&pad)?)
}

/// `(1 - eps) * nll + eps / vocab * smooth_loss`, optionally summed.
fn smoothed(nll: Tensor, smooth_loss: Tensor, vocab: usize, opts: &LossOptions) -> Result<Tensor> {
    let (nll, smooth_loss) = if opts.reduce_loss {
        (nll.sum_all()?, smooth_loss.sum_all()?)
    } else {
        (nll, smooth_loss)
    };
    if opts.epsilon == 0.0 {
        return Ok(nll);
    }
    let eps_i = opts.epsilon / vocab as f64;
    Ok((nll.affine(1.0 - opts.epsilon, 0.0)? + smooth_loss.affine(eps_i, 0.0)?)?)
}

/// Token-level NLL: marginalize each position over documents, then take
/// masked cross-entropy against the left-shifted target.
///
/// `seq_logits` is `[batch * n_docs, t, vocab]`, `doc_scores` `[batch, n_docs]`
/// and `target` `[batch, t]`. Returns `[batch]`, or a scalar when reducing.
pub fn token_nll(seq_logits: &Tensor, doc_scores: &Tensor, target: &Tensor, opts: &LossOptions) -> Result<Tensor> {
    let (_, t, vocab) = seq_logits.dims3()?;
    let target = shift_targets_left(target, opts.pad_token_id)?;
    let rag_logprobs = marginalize_tokens(seq_logits, doc_scores, opts.n_docs)?;
    let (batch, _, _) = rag_logprobs.dims3()?;
    if target.dims() != [batch, t] {
        return Err(RagError::InvalidParams(format!(
            "target shape {:?} does not match logits [{batch}, {t}]",
            target.dims()
        )));
    }

    let index = target.unsqueeze(2)?.contiguous()?;
    let rag_logprobs = rag_logprobs.contiguous()?;
    let ll = rag_logprobs.gather(&index, 2)?.squeeze(2)?;
    let smooth_obj = rag_logprobs.sum(2)?;

    let pad_mask = pad_positions(&target, opts.pad_token_id)?;
    let zeros = ll.zeros_like()?;
    let ll = pad_mask.where_cond(&zeros, &ll)?;
    let smooth_obj = pad_mask.where_cond(&zeros, &smooth_obj)?;

    let nll = ll.sum(1)?.neg()?;
    let smooth_loss = smooth_obj.sum(1)?.neg()?;
    smoothed(nll, smooth_loss, vocab, opts)
}

/// Whether every row of `target` starts with `bos_token_id`.
fn all_start_with(target: &Tensor, bos_token_id: Option<u32>) -> Result<bool> {
    let Some(bos) = bos_token_id else {
        return Ok(false);
    };
    let (_, t) = target.dims2()?;
    if t == 0 {
        return Ok(false);
    }
    let first = target.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<u32>()?;
    Ok(first.iter().all(|&tok| tok == bos))
}

/// Sequence-level NLL: sum each document's token log-likelihoods over the
/// whole target, then marginalize over documents.
///
/// The document prior is attached at the second target position. When
/// `exclude_bos_score` is set and every shifted target starts with BOS, the
/// first position is left out of the likelihood (the smoothing term always
/// covers every position).
pub fn sequence_nll(seq_logits: &Tensor, doc_scores: &Tensor, target: &Tensor, opts: &LossOptions) -> Result<Tensor> {
    let (rows, t, vocab) = seq_logits.dims3()?;
    let batch = queries_for_rows(rows, opts.n_docs)?;
    let n_docs = opts.n_docs;
    let target = shift_targets_left(target, opts.pad_token_id)?;
    if target.dims() != [batch, t] {
        return Err(RagError::InvalidParams(format!(
            "target shape {:?} does not match logits [{batch}, {t}]",
            target.dims()
        )));
    }
    let use_bos = all_start_with(&target, opts.bos_token_id)?;

    let rag_logprobs = sequence_logprobs(seq_logits, doc_scores, n_docs)?;

    let index = target
        .reshape((batch, 1, t, 1))?
        .broadcast_as((batch, n_docs, t, 1))?
        .contiguous()?;
    let rag_logprobs = rag_logprobs.contiguous()?;
    let ll = rag_logprobs.gather(&index, 3)?.squeeze(3)?;
    let smooth_obj = rag_logprobs.sum(3)?;

    let pad_mask = pad_positions(&target, opts.pad_token_id)?
        .reshape((batch, 1, t))?
        .broadcast_as((batch, n_docs, t))?
        .contiguous()?;
    let zeros = ll.zeros_like()?;
    let ll = pad_mask.where_cond(&zeros, &ll)?;
    let smooth_obj = pad_mask.where_cond(&zeros, &smooth_obj)?;

    let ll = marginalize_sequences(&ll, opts.exclude_bos_score && use_bos)?;
    let smooth_obj = marginalize_sequences(&smooth_obj, false)?;

    smoothed(ll.neg()?, smooth_obj.neg()?, vocab, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::ops::log_softmax;

    fn opts(n_docs: usize) -> LossOptions {
        LossOptions {
            n_docs,
            pad_token_id: 0,
            bos_token_id: Some(1),
            epsilon: 0.0,
            reduce_loss: false,
            exclude_bos_score: false,
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    // ─── Shifting ────────────────────────────────────────────────────────────

    #[test]
    fn shift_left_pads_last_column() {
        let target = Tensor::new(&[[1u32, 3, 2], [1, 4, 4]], &Device::Cpu).unwrap();
        let shifted = shift_targets_left(&target, 0).unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(shifted, vec![vec![3, 2, 0], vec![4, 4, 0]]);
    }

    #[test]
    fn shift_right_replaces_ignore_index() {
        let labels = Tensor::new(&[[5i64, -100, 7], [8, 9, -100]], &Device::Cpu).unwrap();
        let shifted = shift_tokens_right(&labels, 2, 1).unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(shifted, vec![vec![2, 5, 1], vec![2, 8, 9]]);
    }

    #[test]
    fn shift_right_rejects_other_negatives() {
        let labels = Tensor::new(&[[-3i64, 5]], &Device::Cpu).unwrap();
        assert!(shift_tokens_right(&labels, 2, 1).is_err());
    }

    // ─── Token NLL ───────────────────────────────────────────────────────────

    #[test]
    fn token_nll_single_doc_is_cross_entropy() {
        let logits = Tensor::new(&[[[0.1f32, 0.2, 0.3, 0.4], [1.0, 0.0, 0.0, 2.0]]], &Device::Cpu).unwrap();
        let scores = Tensor::new(&[[0.0f32]], &Device::Cpu).unwrap();
        // Shifted target = [3, pad]; only position 0 counts.
        let target = Tensor::new(&[[1u32, 3]], &Device::Cpu).unwrap();
        let loss: Vec<f32> = token_nll(&logits, &scores, &target, &opts(1)).unwrap().to_vec1().unwrap();
        let lp: Vec<f32> = log_softmax(&logits.get(0).unwrap().get(0).unwrap(), 0).unwrap().to_vec1().unwrap();
        assert!(close(loss[0], -lp[3]));
    }

    #[test]
    fn token_nll_all_pad_target_is_zero() {
        let logits = Tensor::randn(0f32, 1.0, (2, 3, 5), &Device::Cpu).unwrap();
        let scores = Tensor::new(&[[0.3f32, -0.2]], &Device::Cpu).unwrap();
        let target = Tensor::zeros((1, 3), DType::U32, &Device::Cpu).unwrap();
        let loss: Vec<f32> = token_nll(&logits, &scores, &target, &opts(2)).unwrap().to_vec1().unwrap();
        assert_eq!(loss, vec![0.0]);
    }

    #[test]
    fn token_nll_reduce_sums_examples() {
        let logits = Tensor::randn(0f32, 1.0, (4, 3, 5), &Device::Cpu).unwrap();
        let scores = Tensor::new(&[[0.3f32, -0.2], [1.0, 0.5]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[1u32, 2, 4], [1, 3, 0]], &Device::Cpu).unwrap();
        let per_example: Vec<f32> = token_nll(&logits, &scores, &target, &opts(2)).unwrap().to_vec1().unwrap();
        let reduced = token_nll(
            &logits,
            &scores,
            &target,
            &LossOptions {
                reduce_loss: true,
                ..opts(2)
            },
        )
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
        assert!(close(reduced, per_example.iter().sum()));
    }

    #[test]
    fn label_smoothing_blends_uniform_term() {
        let logits = Tensor::new(&[[[0.0f32, 1.0], [0.0, 0.0]]], &Device::Cpu).unwrap();
        let scores = Tensor::new(&[[0.0f32]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[1u32, 1]], &Device::Cpu).unwrap();
        let eps = 0.2;
        let loss: Vec<f32> = token_nll(
            &logits,
            &scores,
            &target,
            &LossOptions {
                epsilon: eps,
                ..opts(1)
            },
        )
        .unwrap()
        .to_vec1()
        .unwrap();
        let lp0 = -(1.0f32 + 1.0f32.exp()).ln();
        let lp1 = 1.0 - (1.0f32 + 1.0f32.exp()).ln();
        // Shifted target = [1, pad]: position 0 scores token 1.
        let nll = -lp1;
        let smooth = -(lp0 + lp1);
        let expected = (1.0 - eps as f32) * nll + (eps as f32 / 2.0) * smooth;
        assert!(close(loss[0], expected));
    }

    // ─── Sequence NLL ────────────────────────────────────────────────────────

    #[test]
    fn sequence_nll_excludes_bos_only_when_all_rows_start_with_it() {
        let logits = Tensor::randn(0f32, 1.0, (2, 4, 6), &Device::Cpu).unwrap();
        let scores = Tensor::new(&[[0.2f32, -0.4]], &Device::Cpu).unwrap();
        // After the left shift the target starts with BOS (1).
        let target = Tensor::new(&[[2u32, 1, 4, 5]], &Device::Cpu).unwrap();
        let with_bos: Vec<f32> = sequence_nll(&logits, &scores, &target, &opts(2)).unwrap().to_vec1().unwrap();
        let without_bos: Vec<f32> = sequence_nll(
            &logits,
            &scores,
            &target,
            &LossOptions {
                exclude_bos_score: true,
                ..opts(2)
            },
        )
        .unwrap()
        .to_vec1()
        .unwrap();
        assert!(without_bos[0] < with_bos[0]);

        // Shifted target no longer starts with BOS: the flag has no effect.
        let target = Tensor::new(&[[2u32, 3, 4, 5]], &Device::Cpu).unwrap();
        let a: Vec<f32> = sequence_nll(&logits, &scores, &target, &opts(2)).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = sequence_nll(
            &logits,
            &scores,
            &target,
            &LossOptions {
                exclude_bos_score: true,
                ..opts(2)
            },
        )
        .unwrap()
        .to_vec1()
        .unwrap();
        assert!(close(a[0], b[0]));
    }

    #[test]
    fn sequence_nll_identical_docs_ignore_prior() {
        let one = Tensor::randn(0f32, 1.0, (1, 3, 5), &Device::Cpu).unwrap();
        let logits = Tensor::cat(&[&one, &one], 0).unwrap();
        let target = Tensor::new(&[[1u32, 3, 4]], &Device::Cpu).unwrap();
        let skewed = Tensor::new(&[[0.9f32.ln(), 0.1f32.ln()]], &Device::Cpu).unwrap();
        let flat = Tensor::new(&[[0.0f32, 0.0]], &Device::Cpu).unwrap();
        let a: Vec<f32> = sequence_nll(&logits, &skewed, &target, &opts(2)).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = sequence_nll(&logits, &flat, &target, &opts(2)).unwrap().to_vec1().unwrap();
        assert!(close(a[0], b[0]));
    }

    #[test]
    fn sequence_nll_rejects_mismatched_target() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let scores = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        assert!(sequence_nll(&logits, &scores, &target, &opts(2)).is_err());
    }
}
