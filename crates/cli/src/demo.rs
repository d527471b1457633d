//! The scripted demo world behind `rag generate`.
//!
//! Each `[demo]` document becomes one context row holding its answer followed
//! by EOS; the generator echoes that row back, so the decoders' choice among
//! documents is visible in the printed answers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use candle_core::{DType, Device, Tensor};
use rag_core::testing::{ScriptedGenerator, StaticQuestionEncoder};
use rag_core::{GenerateRequest, RagConfig, RagModel};

use crate::config::{DemoConfig, EOS, PAD};

/// Ids below this are reserved for pad, BOS and EOS.
const FIRST_WORD_ID: u32 = 3;

impl DemoConfig {
    pub fn vocab_size(&self) -> usize {
        self.vocab.len() + FIRST_WORD_ID as usize
    }

    fn word_ids(&self) -> HashMap<&str, u32> {
        self.vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.as_str(), i as u32 + FIRST_WORD_ID))
            .collect()
    }

    pub fn encode(&self, words: &[String]) -> anyhow::Result<Vec<u32>> {
        let ids = self.word_ids();
        words
            .iter()
            .map(|w| {
                ids.get(w.as_str())
                    .copied()
                    .ok_or_else(|| anyhow!("word {w:?} is not in the demo vocabulary"))
            })
            .collect()
    }

    /// Token ids back to words, stopping at EOS and skipping BOS and pad.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != EOS)
            .filter(|&&id| id >= FIRST_WORD_ID)
            .filter_map(|&id| self.vocab.get((id - FIRST_WORD_ID) as usize))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A model whose generator reads each document's answer back, plus a
    /// request carrying the documents as precomputed context.
    pub fn build(&self, config: RagConfig) -> anyhow::Result<(RagModel, GenerateRequest)> {
        if self.docs.is_empty() {
            anyhow::bail!("demo config has no documents");
        }
        let device = Device::Cpu;
        let answers = self
            .docs
            .iter()
            .map(|doc| self.encode(&doc.answer))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let width = answers.iter().map(Vec::len).max().unwrap_or(0) + 1;

        let mut context = Vec::with_capacity(answers.len() * width);
        let mut mask = Vec::with_capacity(answers.len() * width);
        for answer in &answers {
            for i in 0..width {
                let id = answer.get(i).copied().unwrap_or(if i == answer.len() { EOS } else { PAD });
                context.push(id);
                mask.push(u32::from(i <= answer.len()));
            }
        }
        let rows = answers.len();
        let scores: Vec<f32> = self.docs.iter().map(|d| d.score).collect();

        let request = GenerateRequest {
            context_input_ids: Some(Tensor::from_vec(context, (rows, width), &device)?),
            context_attention_mask: Some(Tensor::from_vec(mask, (rows, width), &device)?),
            doc_scores: Some(Tensor::from_vec(scores, (1, rows), &device)?),
            n_docs: Some(rows),
            ..Default::default()
        };
        let generator = ScriptedGenerator::echo_context(self.vocab_size(), EOS);
        let question_encoder = StaticQuestionEncoder::new(Tensor::zeros((1, 1), DType::F32, &device)?);
        let model = RagModel::new(Arc::new(question_encoder), Arc::new(generator), None, config)?;
        Ok((model, request))
    }
}
