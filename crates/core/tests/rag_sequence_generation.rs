//! End-to-end RAG-Sequence decoding: per-document candidates, deduplication
//! and rescoring.

use candle_core::{DType, Device, Tensor};
use rag_core::testing::{scripted_rag, ScriptedGenerator, StaticRetriever, BOS, EOS};
use rag_core::{GenerateRequest, GenerationConfig, RagGeneration, RagSequenceForGeneration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn three_doc_request(params: GenerationConfig, do_deduplication: bool) -> GenerateRequest {
    GenerateRequest {
        context_input_ids: Some(Tensor::new(&[[3u32, 4], [3, 4], [5, 3]], &Device::Cpu).unwrap()),
        context_attention_mask: Some(Tensor::ones((3, 2), DType::U32, &Device::Cpu).unwrap()),
        doc_scores: Some(Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap()),
        params: Some(params),
        do_deduplication: Some(do_deduplication),
        ..Default::default()
    }
}

fn three_beams() -> GenerationConfig {
    GenerationConfig {
        num_return_sequences: 3,
        ..GenerationConfig::beam_search(3, 8)
    }
}

fn echo_model(n_docs: usize, retriever: Option<StaticRetriever>) -> RagSequenceForGeneration {
    RagSequenceForGeneration::new(scripted_rag(ScriptedGenerator::echo_context(6, EOS), retriever, n_docs))
}

// ─── Deduplication ───────────────────────────────────────────────────────────

#[test]
fn test_dedup_collapses_identical_documents() {
    let model = echo_model(3, None);
    let out = model
        .generate(three_doc_request(three_beams(), true))
        .unwrap()
        .to_vec2::<u32>()
        .unwrap();
    // Two documents agree on the first answer, so it outscores the second.
    assert_eq!(out, vec![vec![BOS, 3, 4, EOS], vec![BOS, 5, 3, EOS]]);
}

#[test]
fn test_without_dedup_keeps_repeated_candidates() {
    let model = echo_model(3, None);
    let out = model
        .generate(three_doc_request(three_beams(), false))
        .unwrap()
        .to_vec2::<u32>()
        .unwrap();
    assert_eq!(out.len(), 3);
    for row in &out {
        assert!(row == &vec![BOS, 3, 4, EOS] || row == &vec![BOS, 5, 3, EOS]);
    }
}

#[test]
fn test_single_return_sequence_picks_best_candidate() {
    let model = echo_model(3, None);
    let out = model
        .generate(three_doc_request(GenerationConfig::beam_search(3, 8), true))
        .unwrap()
        .to_vec2::<u32>()
        .unwrap();
    assert_eq!(out, vec![vec![BOS, 3, 4, EOS]]);
}

#[test]
fn test_dedup_rescores_only_unique_candidates() {
    // Greedy yields one candidate per document: two identical, one distinct.
    // Asking for every candidate back returns exactly the rows scored.
    let params = GenerationConfig {
        num_return_sequences: 3,
        ..GenerationConfig::greedy(8)
    };
    let model = echo_model(3, None);

    let deduped = model
        .generate(three_doc_request(params.clone(), true))
        .unwrap()
        .to_vec2::<u32>()
        .unwrap();
    assert_eq!(deduped, vec![vec![BOS, 3, 4, EOS], vec![BOS, 5, 3, EOS]]);

    let all = model
        .generate(three_doc_request(params, false))
        .unwrap()
        .to_vec2::<u32>()
        .unwrap();
    assert_eq!(
        all,
        vec![vec![BOS, 3, 4, EOS], vec![BOS, 3, 4, EOS], vec![BOS, 5, 3, EOS]]
    );
}

#[test]
fn test_return_sequences_may_exceed_beams() {
    let params = GenerationConfig {
        num_return_sequences: 2,
        ..GenerationConfig::greedy(8)
    };
    let out = echo_model(3, None)
        .generate(three_doc_request(params, true))
        .unwrap()
        .to_vec2::<u32>()
        .unwrap();
    assert_eq!(out, vec![vec![BOS, 3, 4, EOS], vec![BOS, 5, 3, EOS]]);
}

#[test]
fn test_return_sequences_bounded_by_candidate_pool() {
    let params = GenerationConfig {
        num_return_sequences: 4,
        ..GenerationConfig::greedy(8)
    };
    assert!(echo_model(3, None).generate(three_doc_request(params, true)).is_err());
}

// ─── Batches and retrieval ───────────────────────────────────────────────────

#[test]
fn test_batch_results_are_padded_together() {
    let model = echo_model(1, None);
    let request = GenerateRequest {
        context_input_ids: Some(Tensor::new(&[[3u32, 4, 5], [4, EOS, 0]], &Device::Cpu).unwrap()),
        context_attention_mask: Some(Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], &Device::Cpu).unwrap()),
        doc_scores: Some(Tensor::zeros((2, 1), DType::F32, &Device::Cpu).unwrap()),
        params: Some(GenerationConfig::greedy(8)),
        ..Default::default()
    };
    let out = model.generate(request).unwrap().to_vec2::<u32>().unwrap();
    assert_eq!(out, vec![vec![BOS, 3, 4, 5, EOS], vec![BOS, 4, EOS, 0, 0]]);
}

#[test]
fn test_rescoring_through_retriever() {
    let retriever = StaticRetriever::new(
        Tensor::new(&[[3u32, 4], [5, 3]], &Device::Cpu).unwrap(),
        Tensor::zeros((1, 2, 1), DType::F32, &Device::Cpu).unwrap(),
    );
    let model = echo_model(2, Some(retriever));
    let request = GenerateRequest {
        input_ids: Some(Tensor::new(&[[7u32, 8]], &Device::Cpu).unwrap()),
        params: Some(GenerationConfig {
            num_return_sequences: 2,
            ..GenerationConfig::beam_search(2, 8)
        }),
        ..Default::default()
    };
    let mut out = model.generate(request).unwrap().to_vec2::<u32>().unwrap();
    out.sort();
    assert_eq!(out, vec![vec![BOS, 3, 4, EOS], vec![BOS, 5, 3, EOS]]);
}

#[test]
fn test_missing_doc_scores_is_an_error() {
    let model = echo_model(3, None);
    let mut request = three_doc_request(three_beams(), true);
    request.doc_scores = None;
    assert!(model.generate(request).is_err());
}
