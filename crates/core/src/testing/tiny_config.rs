use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::mock_model::{ScriptedGenerator, StaticQuestionEncoder, StaticRetriever};
use crate::config::{RagConfig, TokenIds};
use crate::model::RagModel;

pub const PAD: u32 = 0;
pub const BOS: u32 = 1;
pub const EOS: u32 = 2;

/// `n_docs` documents, BOS as decoder start, greedy decoding up to 8 tokens.
pub fn tiny_rag_config(n_docs: usize) -> RagConfig {
    let mut config = RagConfig {
        n_docs,
        tokens: TokenIds {
            bos_token_id: Some(BOS),
            eos_token_id: Some(EOS),
            pad_token_id: PAD,
            decoder_start_token_id: BOS,
        },
        ..Default::default()
    };
    config.generation.max_length = 8;
    config
}

/// A model around `generator` with a one-dimensional zero question encoder.
pub fn scripted_rag(generator: ScriptedGenerator, retriever: Option<StaticRetriever>, n_docs: usize) -> RagModel {
    let question = Tensor::zeros((1, 1), candle_core::DType::F32, &Device::Cpu)
        .expect("zero question embedding");
    RagModel::new(
        Arc::new(StaticQuestionEncoder::new(question)),
        Arc::new(generator),
        retriever.map(|r| Arc::new(r) as Arc<dyn crate::model::Retriever>),
        tiny_rag_config(n_docs),
    )
    .expect("tiny config is valid")
}
