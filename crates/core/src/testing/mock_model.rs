use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};

use crate::cache::{EncoderState, LayerCache};
use crate::config::{GenerationConfig, TokenIds};
use crate::model::{DocSet, Generator, GeneratorOutput, QuestionEncoder, Retriever};
use crate::sampling::argmax;

/// Next-token logits as a function of (document context, decoded prefix).
pub type Script = Arc<dyn Fn(&[u32], &[u32]) -> Vec<f32> + Send + Sync>;

/// Logits with `token` at 0 and every other entry at -10.
pub fn peaked_logits(vocab_size: usize, token: u32) -> Vec<f32> {
    let mut logits = vec![-10.0; vocab_size];
    if let Some(l) = logits.get_mut(token as usize) {
        *l = 0.0;
    }
    logits
}

/// A generator driven by a [`Script`].
///
/// The encoder output is the context ids themselves (`[rows, src_len, 1]`),
/// and the decoder cache is the full decoded history per row
/// (`[rows, len, 1]`), so a wrong cache reorder shows up as a wrong prefix
/// handed to the script.
pub struct ScriptedGenerator {
    vocab_size: usize,
    device: Device,
    script: Script,
    encoder_decoder: bool,
}

impl ScriptedGenerator {
    pub fn new(vocab_size: usize, script: impl Fn(&[u32], &[u32]) -> Vec<f32> + Send + Sync + 'static) -> Self {
        Self {
            vocab_size,
            device: Device::Cpu,
            script: Arc::new(script),
            encoder_decoder: true,
        }
    }

    /// Always prefers `token`.
    pub fn constant(vocab_size: usize, token: u32) -> Self {
        Self::new(vocab_size, move |_, _| peaked_logits(vocab_size, token))
    }

    /// Prefers `tokens[i]` after `i + 1` decoded tokens, then repeats the last.
    pub fn emit(vocab_size: usize, tokens: Vec<u32>) -> Self {
        Self::new(vocab_size, move |_, prefix| {
            let step = prefix.len().saturating_sub(1);
            let token = tokens.get(step).or(tokens.last()).copied().unwrap_or(0);
            peaked_logits(vocab_size, token)
        })
    }

    /// Copies the document context token by token, then prefers `eos`.
    pub fn echo_context(vocab_size: usize, eos: u32) -> Self {
        Self::new(vocab_size, move |context, prefix| {
            let step = prefix.len().saturating_sub(1);
            let token = context.get(step).copied().unwrap_or(eos);
            peaked_logits(vocab_size, token)
        })
    }

    pub fn decoder_only(mut self) -> Self {
        self.encoder_decoder = false;
        self
    }

    fn contexts(encoder_state: &EncoderState) -> Result<Vec<Vec<u32>>> {
        let rows = encoder_state.hidden_states.squeeze(2)?.to_vec2::<f32>()?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_iter().map(|x| x as u32).collect())
            .collect())
    }

    fn logits_for(&self, context: &[u32], prefix: &[u32]) -> Result<Vec<f32>> {
        let logits = (self.script)(context, prefix);
        if logits.len() != self.vocab_size {
            candle_core::bail!("script returned {} logits, expected {}", logits.len(), self.vocab_size);
        }
        Ok(logits)
    }
}

impl Generator for ScriptedGenerator {
    fn encode(&self, context_input_ids: &Tensor, _context_attention_mask: Option<&Tensor>) -> Result<EncoderState> {
        let hidden = context_input_ids.to_dtype(DType::F32)?.unsqueeze(2)?;
        Ok(EncoderState::new(hidden))
    }

    fn decode_step(
        &self,
        decoder_input_ids: &Tensor,
        encoder_state: &EncoderState,
        _attention_mask: Option<&Tensor>,
        past: Option<&[LayerCache]>,
    ) -> Result<GeneratorOutput> {
        let ids = decoder_input_ids.to_vec2::<u32>()?;
        let contexts = Self::contexts(encoder_state)?;
        let rows = ids.len();
        if contexts.len() != rows {
            candle_core::bail!("{rows} decoder rows for {} encoder rows", contexts.len());
        }
        let previous: Vec<Vec<u32>> = match past.and_then(|layers| layers.first()) {
            Some(layer) => layer.tensors[0]
                .squeeze(2)?
                .to_vec2::<f32>()?
                .into_iter()
                .map(|r| r.into_iter().map(|x| x as u32).collect())
                .collect(),
            None => vec![Vec::new(); rows],
        };

        let tgt_len = ids.first().map(Vec::len).unwrap_or(0);
        let mut logits = Vec::with_capacity(rows * tgt_len * self.vocab_size);
        let mut histories = Vec::with_capacity(rows);
        for (row, new_ids) in ids.iter().enumerate() {
            let mut history = previous[row].clone();
            for &token in new_ids {
                history.push(token);
                logits.extend(self.logits_for(&contexts[row], &history)?);
            }
            histories.push(history);
        }
        let logits = Tensor::from_vec(logits, (rows, tgt_len, self.vocab_size), &self.device)?;

        let total = histories.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<f32> = histories.into_iter().flatten().map(|t| t as f32).collect();
        let history = Tensor::from_vec(flat, (rows, total, 1), &self.device)?;
        Ok(GeneratorOutput {
            logits,
            past: Some(vec![LayerCache::new(vec![history])]),
        })
    }

    /// Greedy decoding per context row, each result repeated
    /// `num_return_sequences` times.
    fn generate(
        &self,
        context_input_ids: &Tensor,
        _context_attention_mask: Option<&Tensor>,
        params: &GenerationConfig,
        tokens: &TokenIds,
    ) -> Result<Tensor> {
        let contexts = context_input_ids.to_vec2::<u32>()?;
        let mut outputs = Vec::new();
        for context in &contexts {
            let mut seq = vec![tokens.decoder_start_token_id];
            while seq.len() < params.max_length {
                let next = argmax(&self.logits_for(context, &seq)?);
                seq.push(next);
                if Some(next) == tokens.eos_token_id {
                    break;
                }
            }
            for _ in 0..params.num_return_sequences {
                outputs.push(seq.clone());
            }
        }
        let width = outputs.iter().map(Vec::len).max().unwrap_or(0);
        let rows = outputs.len();
        let flat: Vec<u32> = outputs
            .into_iter()
            .flat_map(|mut s| {
                s.resize(width, tokens.pad_token_id);
                s
            })
            .collect();
        Tensor::from_vec(flat, (rows, width), &self.device)
    }

    fn is_encoder_decoder(&self) -> bool {
        self.encoder_decoder
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Returns the same embeddings for every batch.
pub struct StaticQuestionEncoder {
    embeddings: Tensor,
}

impl StaticQuestionEncoder {
    pub fn new(embeddings: Tensor) -> Self {
        Self { embeddings }
    }
}

impl QuestionEncoder for StaticQuestionEncoder {
    fn encode(&self, input_ids: &Tensor, _attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let batch = input_ids.dim(0)?;
        let stored = self.embeddings.dim(0)?;
        if batch == stored {
            Ok(self.embeddings.clone())
        } else {
            self.embeddings.narrow(0, 0, 1)?.repeat((batch, 1))
        }
    }
}

/// Returns a fixed document set regardless of the query.
pub struct StaticRetriever {
    context_input_ids: Tensor,
    doc_embeds: Tensor,
}

impl StaticRetriever {
    /// `context_input_ids` is `[batch * n_docs, len]`, `doc_embeds`
    /// `[batch, n_docs, dim]`.
    pub fn new(context_input_ids: Tensor, doc_embeds: Tensor) -> Self {
        Self {
            context_input_ids,
            doc_embeds,
        }
    }
}

impl Retriever for StaticRetriever {
    /// A single stored query's documents are repeated for every query.
    fn retrieve(&self, input_ids: &Tensor, _query_embeddings: &Tensor, _n_docs: usize) -> Result<DocSet> {
        let (stored, docs, _) = self.doc_embeds.dims3()?;
        let batch = input_ids.dim(0)?;
        let (context_input_ids, doc_embeds) = if stored == 1 && batch > 1 {
            (
                self.context_input_ids.repeat((batch, 1))?,
                self.doc_embeds.repeat((batch, 1, 1))?,
            )
        } else {
            (self.context_input_ids.clone(), self.doc_embeds.clone())
        };
        Ok(DocSet {
            context_attention_mask: context_input_ids.ones_like()?,
            context_input_ids,
            doc_embeds,
            doc_ids: (0..batch)
                .map(|b| (0..docs).map(|d| (b * docs + d) as u64).collect())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_generator_logit_shape() {
        let generator = ScriptedGenerator::constant(6, 3);
        let context = Tensor::new(&[[4u32, 5], [5, 4]], &Device::Cpu).unwrap();
        let state = generator.encode(&context, None).unwrap();
        let ids = Tensor::new(&[[1u32, 3, 3], [1, 3, 3]], &Device::Cpu).unwrap();
        let out = generator.decode_step(&ids, &state, None, None).unwrap();
        assert_eq!(out.logits.dims(), &[2, 3, 6]);
    }

    #[test]
    fn test_scripted_generator_cache_holds_history() {
        let generator = ScriptedGenerator::emit(6, vec![3, 4, 2]);
        let context = Tensor::new(&[[5u32]], &Device::Cpu).unwrap();
        let state = generator.encode(&context, None).unwrap();
        let first = generator
            .decode_step(&Tensor::new(&[[1u32]], &Device::Cpu).unwrap(), &state, None, None)
            .unwrap();
        let second = generator
            .decode_step(
                &Tensor::new(&[[3u32]], &Device::Cpu).unwrap(),
                &state,
                None,
                first.past.as_deref(),
            )
            .unwrap();
        let history = second.past.unwrap()[0].tensors[0]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(history, vec![1.0, 3.0]);
        // Prefix [1, 3] is two tokens long, so token 4 is preferred.
        let logits = second.logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(argmax(&logits), 4);
    }

    #[test]
    fn test_scripted_generate_stops_at_eos() {
        let generator = ScriptedGenerator::echo_context(6, 2);
        let context = Tensor::new(&[[4u32, 5], [3, 0]], &Device::Cpu).unwrap();
        let params = GenerationConfig {
            num_beams: 2,
            num_return_sequences: 2,
            max_length: 10,
            ..Default::default()
        };
        let tokens = TokenIds {
            eos_token_id: Some(2),
            decoder_start_token_id: 1,
            ..Default::default()
        };
        let out = generator.generate(&context, None, &params, &tokens).unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], vec![1, 4, 5, 2]);
        assert_eq!(out[1], vec![1, 4, 5, 2]);
        // Context token 0 is echoed as-is; only running past the context yields EOS.
        assert_eq!(out[2], vec![1, 3, 0, 2]);
    }
}
