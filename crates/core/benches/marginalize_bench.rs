//! Criterion benchmarks for document marginalization, the loss engine and
//! beam candidate selection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use rag_core::loss::{sequence_nll, token_nll, LossOptions};
use rag_core::marginalize::marginalize_tokens;
use rag_core::sampling::top_candidates;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_seq_logits(rows: usize, t: usize, vocab_size: usize) -> Tensor {
    let data: Vec<f32> = (0..rows * t * vocab_size)
        .map(|i| (i as f32 * 0.013).sin() * 5.0)
        .collect();
    Tensor::from_vec(data, (rows, t, vocab_size), &Device::Cpu).expect("failed to create seq logits")
}

fn make_doc_scores(batch: usize, n_docs: usize) -> Tensor {
    let data: Vec<f32> = (0..batch * n_docs).map(|i| (i as f32 * 0.7).cos()).collect();
    Tensor::from_vec(data, (batch, n_docs), &Device::Cpu).expect("failed to create doc scores")
}

fn make_target(batch: usize, t: usize, vocab_size: usize) -> Tensor {
    let data: Vec<u32> = (0..batch * t).map(|i| 1 + (i * 31 % (vocab_size - 1)) as u32).collect();
    Tensor::from_vec(data, (batch, t), &Device::Cpu).expect("failed to create target")
}

fn loss_options(n_docs: usize) -> LossOptions {
    LossOptions {
        n_docs,
        pad_token_id: 0,
        bos_token_id: Some(1),
        epsilon: 0.1,
        reduce_loss: true,
        exclude_bos_score: false,
    }
}

// ---------------------------------------------------------------------------
// Marginalization
// ---------------------------------------------------------------------------

fn bench_marginalize_tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("marginalize_tokens");
    let (batch, t) = (4, 1);

    for &n_docs in &[5, 10] {
        let seq_logits = make_seq_logits(batch * n_docs, t, 32_000);
        let doc_scores = make_doc_scores(batch, n_docs);
        group.bench_with_input(BenchmarkId::new("n_docs", n_docs), &n_docs, |b, &n_docs| {
            b.iter(|| marginalize_tokens(black_box(&seq_logits), black_box(&doc_scores), n_docs).unwrap());
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

fn bench_losses(c: &mut Criterion) {
    let mut group = c.benchmark_group("nll");
    let (batch, n_docs, t, vocab_size) = (2, 5, 16, 8_000);
    let seq_logits = make_seq_logits(batch * n_docs, t, vocab_size);
    let doc_scores = make_doc_scores(batch, n_docs);
    let target = make_target(batch, t, vocab_size);
    let opts = loss_options(n_docs);

    group.bench_function("token", |b| {
        b.iter(|| token_nll(black_box(&seq_logits), &doc_scores, &target, &opts).unwrap());
    });
    group.bench_function("sequence", |b| {
        b.iter(|| sequence_nll(black_box(&seq_logits), &doc_scores, &target, &opts).unwrap());
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// Beam candidates
// ---------------------------------------------------------------------------

fn bench_top_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("top_candidates");

    for &num_beams in &[4, 8] {
        let scores: Vec<f32> = (0..num_beams * 32_000)
            .map(|i| (i as f32 * 0.017).sin() * 5.0)
            .collect();
        group.bench_with_input(BenchmarkId::new("beams", num_beams), &num_beams, |b, &num_beams| {
            b.iter(|| top_candidates(black_box(&scores), 2 * num_beams));
        });
    }
    group.finish();
}

criterion_group!(marginalize, bench_marginalize_tokens, bench_losses);
criterion_group!(beams, bench_top_candidates);
criterion_main!(marginalize, beams);
