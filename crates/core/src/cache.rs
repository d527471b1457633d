//! Autoregressive cache carried through a decode loop.
//!
//! Decoder rows are laid out `(batch, beam, doc)` row-major, so every cache
//! tensor has a leading axis of `batch * num_beams * n_docs`. The document
//! fold is kept as explicit metadata on [`GenerationCache`] and reordering
//! permutes whole `n_docs` blocks, never rows inside a block.
//!
//! A cache is never mutated in place: [`GenerationCache::reorder`] and
//! [`GenerationCache::with_decoder`] build a new value, so a decode loop that
//! stops between steps always holds a consistent cache.

use candle_core::{Device, Tensor};

use crate::error::{RagError, Result};

/// Generator encoder output for every context row.
#[derive(Debug, Clone)]
pub struct EncoderState {
    /// `[rows, src_len, hidden]`
    pub hidden_states: Tensor,
}

impl EncoderState {
    pub fn new(hidden_states: Tensor) -> Self {
        Self { hidden_states }
    }

    pub fn rows(&self) -> Result<usize> {
        Ok(self.hidden_states.dim(0)?)
    }

    pub fn device(&self) -> &Device {
        self.hidden_states.device()
    }
}

/// Key/value history of one decoder layer; every tensor's leading axis is the
/// decoder row axis.
#[derive(Debug, Clone)]
pub struct LayerCache {
    pub tensors: Vec<Tensor>,
}

impl LayerCache {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }
}

/// Loose cache components, as handed over by a caller that assembled a cache
/// itself.
#[derive(Debug, Clone)]
pub enum CachePart {
    Encoder(EncoderState),
    Decoder(Vec<LayerCache>),
}

/// Encoder output plus optional decoder history.
#[derive(Debug, Clone)]
pub struct GenerationCache {
    encoder: EncoderState,
    decoder: Option<Vec<LayerCache>>,
    n_docs: usize,
}

impl GenerationCache {
    pub fn new(encoder: EncoderState, n_docs: usize) -> Self {
        Self {
            encoder,
            decoder: None,
            n_docs,
        }
    }

    /// Accepts `[Encoder]` or `[Encoder, Decoder]`.
    pub fn from_parts(parts: Vec<CachePart>, n_docs: usize) -> Result<Self> {
        let mut parts = parts.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(CachePart::Encoder(encoder)), None, None) => Ok(Self::new(encoder, n_docs)),
            (Some(CachePart::Encoder(encoder)), Some(CachePart::Decoder(layers)), None) => Ok(Self {
                encoder,
                decoder: Some(layers),
                n_docs,
            }),
            (None, _, _) => Err(RagError::MalformedCache("cache has no parts".into())),
            (_, _, Some(_)) => Err(RagError::MalformedCache(
                "cache has more than two parts".into(),
            )),
            _ => Err(RagError::MalformedCache(
                "expected (encoder) or (encoder, decoder) parts".into(),
            )),
        }
    }

    pub fn into_parts(self) -> Vec<CachePart> {
        let mut parts = vec![CachePart::Encoder(self.encoder)];
        if let Some(layers) = self.decoder {
            parts.push(CachePart::Decoder(layers));
        }
        parts
    }

    pub fn encoder(&self) -> &EncoderState {
        &self.encoder
    }

    pub fn decoder(&self) -> Option<&[LayerCache]> {
        self.decoder.as_deref()
    }

    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    pub fn has_history(&self) -> bool {
        self.decoder.is_some()
    }

    /// Replace the decoder history wholesale.
    pub fn with_decoder(self, decoder: Option<Vec<LayerCache>>) -> Self {
        Self { decoder, ..self }
    }

    /// Permute the decoder history by beam: new beam row `i` takes the
    /// history of old beam row `beam_idx[i]`. The encoder part is shared by
    /// all beams of a batch element and is left as is.
    pub fn reorder(&self, beam_idx: &[u32]) -> Result<Self> {
        let Some(layers) = &self.decoder else {
            return Ok(self.clone());
        };
        let index = Tensor::from_slice(beam_idx, beam_idx.len(), self.encoder.device())?;
        let layers = layers
            .iter()
            .map(|layer| {
                let tensors = layer
                    .tensors
                    .iter()
                    .map(|t| reorder_rows(t, &index, self.n_docs))
                    .collect::<Result<Vec<_>>>()?;
                Ok(LayerCache::new(tensors))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            encoder: self.encoder.clone(),
            decoder: Some(layers),
            n_docs: self.n_docs,
        })
    }
}

/// Reorder the leading axis of `t` by beam.
///
/// A leading axis of `beams * n_docs` is viewed as `(beams, n_docs, ...)` so
/// each beam's block of documents moves together; a leading axis of `beams`
/// is permuted directly.
pub fn reorder_rows(t: &Tensor, beam_idx: &Tensor, n_docs: usize) -> Result<Tensor> {
    let beams = beam_idx.dim(0)?;
    let dims = t.dims().to_vec();
    let Some(&leading) = dims.first() else {
        return Err(RagError::MalformedCache("cache tensor has rank 0".into()));
    };
    if leading == beams {
        return Ok(t.index_select(beam_idx, 0)?);
    }
    if leading != beams * n_docs {
        return Err(RagError::MalformedCache(format!(
            "cache leading axis {leading} is neither {beams} beams nor {beams} x {n_docs} docs"
        )));
    }
    let mut folded = vec![beams, n_docs];
    folded.extend_from_slice(&dims[1..]);
    let reordered = t.reshape(folded)?.index_select(beam_idx, 0)?;
    Ok(reordered.reshape(dims)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn encoder(rows: usize) -> EncoderState {
        EncoderState::new(Tensor::zeros((rows, 2, 3), DType::F32, &Device::Cpu).unwrap())
    }

    fn cache_with_rows(beams: usize, n_docs: usize) -> GenerationCache {
        let rows = beams * n_docs;
        let keys = Tensor::arange(0f32, (rows * 4) as f32, &Device::Cpu)
            .unwrap()
            .reshape((rows, 2, 2))
            .unwrap();
        let values = keys.affine(10.0, 1.0).unwrap();
        GenerationCache::new(encoder(rows), n_docs)
            .with_decoder(Some(vec![LayerCache::new(vec![keys, values])]))
    }

    fn flat(cache: &GenerationCache) -> Vec<Vec<f32>> {
        cache
            .decoder()
            .unwrap()
            .iter()
            .flat_map(|l| l.tensors.iter())
            .map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    // ─── Structure ───────────────────────────────────────────────────────────

    #[test]
    fn test_from_parts_encoder_only() {
        let cache = GenerationCache::from_parts(vec![CachePart::Encoder(encoder(2))], 2).unwrap();
        assert!(!cache.has_history());
    }

    #[test]
    fn test_from_parts_encoder_and_decoder() {
        let cache = GenerationCache::from_parts(
            vec![CachePart::Encoder(encoder(2)), CachePart::Decoder(vec![])],
            2,
        )
        .unwrap();
        assert!(cache.has_history());
        assert_eq!(cache.into_parts().len(), 2);
    }

    #[test]
    fn test_from_parts_rejects_malformed() {
        let cases = vec![
            vec![],
            vec![CachePart::Decoder(vec![])],
            vec![CachePart::Encoder(encoder(1)), CachePart::Encoder(encoder(1))],
            vec![
                CachePart::Encoder(encoder(1)),
                CachePart::Decoder(vec![]),
                CachePart::Decoder(vec![]),
            ],
        ];
        for parts in cases {
            let err = GenerationCache::from_parts(parts, 1).unwrap_err();
            assert!(matches!(err, RagError::MalformedCache(_)));
        }
    }

    // ─── Reorder ─────────────────────────────────────────────────────────────

    #[test]
    fn test_reorder_without_history_is_noop() {
        let cache = GenerationCache::new(encoder(4), 2);
        let reordered = cache.reorder(&[1, 0]).unwrap();
        assert!(!reordered.has_history());
    }

    #[test]
    fn test_reorder_identity() {
        let cache = cache_with_rows(3, 2);
        let reordered = cache.reorder(&[0, 1, 2]).unwrap();
        assert_eq!(flat(&cache), flat(&reordered));
    }

    #[test]
    fn test_reorder_then_inverse_round_trips() {
        let cache = cache_with_rows(4, 3);
        let perm = [2u32, 0, 3, 1];
        let mut inverse = [0u32; 4];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p as usize] = i as u32;
        }
        let there = cache.reorder(&perm).unwrap();
        assert_ne!(flat(&cache), flat(&there));
        let back = there.reorder(&inverse).unwrap();
        assert_eq!(flat(&cache), flat(&back));
    }

    #[test]
    fn test_reorder_moves_document_blocks_together() {
        // 2 beams x 2 docs, one scalar per row: rows [b0d0, b0d1, b1d0, b1d1].
        let t = Tensor::new(&[10f32, 11., 20., 21.], &Device::Cpu).unwrap();
        let idx = Tensor::new(&[1u32, 1], &Device::Cpu).unwrap();
        let out = reorder_rows(&t, &idx, 2).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![20., 21., 20., 21.]);
    }

    #[test]
    fn test_reorder_without_doc_axis() {
        let t = Tensor::new(&[[1f32, 1.], [2., 2.], [3., 3.]], &Device::Cpu).unwrap();
        let idx = Tensor::new(&[2u32, 0, 1], &Device::Cpu).unwrap();
        let out = reorder_rows(&t, &idx, 4).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![3., 3.], vec![1., 1.], vec![2., 2.]]);
    }

    #[test]
    fn test_reorder_rejects_mismatched_leading_axis() {
        let t = Tensor::zeros((5, 2), DType::F32, &Device::Cpu).unwrap();
        let idx = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        let err = reorder_rows(&t, &idx, 2).unwrap_err();
        assert!(matches!(err, RagError::MalformedCache(_)));
    }

    #[test]
    fn test_reorder_leaves_encoder_untouched() {
        let cache = cache_with_rows(2, 2);
        let before = cache.encoder().hidden_states.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let after = cache
            .reorder(&[1, 0])
            .unwrap()
            .encoder()
            .hidden_states
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }
}
