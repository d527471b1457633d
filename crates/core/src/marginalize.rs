//! Cross-document marginalization in log space.
//!
//! Generator rows are laid out document-major inside each query: row
//! `q * n_docs + d` holds document `d` of query `q`. Doc scores are always
//! log-softmax normalized across a query's documents before they are combined
//! with token log-probabilities, and every reduction over the document axis
//! goes through [`logsumexp`].

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::error::{RagError, Result};

/// Numerically stable `log(sum(exp(xs)))` along `dim`, removing that dim.
///
/// Slices that are entirely `-inf` reduce to `-inf` instead of NaN.
pub fn logsumexp(xs: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let floor = Tensor::full(f32::MIN, max.shape(), max.device())?.to_dtype(max.dtype())?;
    let finite = max.ge(&floor)?;
    let max = finite.where_cond(&max, &max.zeros_like()?)?;
    let summed = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (summed + max)?.squeeze(dim)
}

/// Split `rows` generator rows into queries of `n_docs` documents.
pub fn queries_for_rows(rows: usize, n_docs: usize) -> Result<usize> {
    if n_docs == 0 || rows % n_docs != 0 {
        return Err(RagError::DocCountMismatch { rows, n_docs });
    }
    Ok(rows / n_docs)
}

/// Log-normalized document priors, `[batch, n_docs]`.
pub fn doc_log_priors(doc_scores: &Tensor, batch: usize, n_docs: usize) -> Result<Tensor> {
    let dims = doc_scores.dims();
    if dims != [batch, n_docs] {
        return Err(RagError::RetrievalMismatch(format!(
            "doc_scores has shape {dims:?}, expected [{batch}, {n_docs}]"
        )));
    }
    Ok(log_softmax(&doc_scores.to_dtype(DType::F32)?, 1)?)
}

/// Token-level marginalization.
///
/// `seq_logits` is `[batch * n_docs, t, vocab]`, `doc_scores` is
/// `[batch, n_docs]`. Returns `log sum_d p(d | x) p(y_i | x, d, y_<i)` as a
/// `[batch, t, vocab]` tensor.
pub fn marginalize_tokens(seq_logits: &Tensor, doc_scores: &Tensor, n_docs: usize) -> Result<Tensor> {
    let (rows, t, vocab) = seq_logits.dims3()?;
    let batch = queries_for_rows(rows, n_docs)?;
    let seq_logprobs = log_softmax(&seq_logits.to_dtype(DType::F32)?, D::Minus1)?
        .reshape((batch, n_docs, t, vocab))?;
    let doc_logprobs = doc_log_priors(doc_scores, batch, n_docs)?.reshape((batch, n_docs, 1, 1))?;
    let joint = seq_logprobs.broadcast_add(&doc_logprobs)?;
    Ok(logsumexp(&joint, 1)?)
}

/// Per-document token log-probabilities with the document prior folded in at
/// the second target position, `[batch, n_docs, t, vocab]`.
///
/// The first target token is shared by every document (a start token) and
/// carries no document signal, so the prior is attached to the second
/// position. Summing over `t` then yields `log p(d) + log p(y | x, d)` per
/// document for any target of length two or more.
pub fn sequence_logprobs(seq_logits: &Tensor, doc_scores: &Tensor, n_docs: usize) -> Result<Tensor> {
    let (rows, t, vocab) = seq_logits.dims3()?;
    let batch = queries_for_rows(rows, n_docs)?;
    let seq_logprobs = log_softmax(&seq_logits.to_dtype(DType::F32)?, D::Minus1)?
        .reshape((batch, n_docs, t, vocab))?;
    let doc_logprobs = doc_log_priors(doc_scores, batch, n_docs)?.reshape((batch, n_docs, 1, 1))?;

    if t < 2 {
        return Ok(seq_logprobs.contiguous()?);
    }
    let mut pieces = vec![
        seq_logprobs.narrow(2, 0, 1)?,
        seq_logprobs.narrow(2, 1, 1)?.broadcast_add(&doc_logprobs)?,
    ];
    if t > 2 {
        pieces.push(seq_logprobs.narrow(2, 2, t - 2)?);
    }
    // `cat` on an inner axis yields a strided view; `gather` needs contiguous.
    Ok(Tensor::cat(&pieces, 2)?.contiguous()?)
}

/// Reduce per-document token log-likelihoods `[batch, n_docs, t]` to one
/// marginal sequence log-likelihood per query, `[batch]`.
///
/// Tokens are summed over the target axis before the log-sum-exp over
/// documents. With `skip_first` the first position does not contribute.
pub fn marginalize_sequences(token_ll: &Tensor, skip_first: bool) -> Result<Tensor> {
    let (_, _, t) = token_ll.dims3()?;
    let scored = if skip_first && t > 0 {
        token_ll.narrow(2, 1, t - 1)?
    } else {
        token_ll.clone()
    };
    let per_doc = scored.sum(2)?;
    Ok(logsumexp(&per_doc, 1)?)
}
