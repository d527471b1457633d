//! Row layout helpers for the folded `(batch, beam, doc)` axis.

use candle_core::{Device, Tensor};

use crate::error::Result;

fn select_rows(t: &Tensor, rows: Vec<u32>) -> Result<Tensor> {
    let len = rows.len();
    let index = Tensor::from_vec(rows, len, t.device())?;
    Ok(t.index_select(&index, 0)?)
}

/// Repeat every row `repeats` times in place: `[a, b] -> [a, a, b, b]`.
pub fn repeat_interleave(t: &Tensor, repeats: usize) -> Result<Tensor> {
    let rows = t.dim(0)?;
    let index = (0..rows as u32)
        .flat_map(|r| std::iter::repeat(r).take(repeats))
        .collect();
    select_rows(t, index)
}

/// Repeat the whole row block `repeats` times: `[a, b] -> [a, b, a, b]`.
pub fn tile_rows(t: &Tensor, repeats: usize) -> Result<Tensor> {
    let rows = t.dim(0)? as u32;
    let index = (0..repeats).flat_map(|_| 0..rows).collect();
    select_rows(t, index)
}

/// Replicate `(batch, doc)` rows across beams, producing the
/// `(batch, beam, doc)` layout: row `(b, k, d)` copies input row `(b, d)`.
pub fn expand_for_beams(t: &Tensor, batch: usize, num_beams: usize, n_docs: usize) -> Result<Tensor> {
    if num_beams == 1 {
        return Ok(t.clone());
    }
    let mut index = Vec::with_capacity(batch * num_beams * n_docs);
    for b in 0..batch {
        for _ in 0..num_beams {
            index.extend((0..n_docs).map(|d| (b * n_docs + d) as u32));
        }
    }
    select_rows(t, index)
}

/// Right-pad token rows to a common width and stack them as `[rows, width]`.
pub fn pad_rows(rows: &[Vec<u32>], width: usize, pad_token_id: u32, device: &Device) -> Result<Tensor> {
    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        let take = row.len().min(width);
        flat.extend_from_slice(&row[..take]);
        flat.extend(std::iter::repeat(pad_token_id).take(width - take));
    }
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// Stack equal-length score rows as `[rows, width]`.
pub fn stack_rows(rows: &[Vec<f32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// Concatenate `[rows_i, len_i]` token tensors along rows, right-padding each
/// to the longest `len_i`.
pub fn cat_and_pad(tensors: &[Tensor], pad_token_id: u32) -> Result<Tensor> {
    let device = match tensors.first() {
        Some(t) => t.device().clone(),
        None => Device::Cpu,
    };
    let mut rows = Vec::new();
    for t in tensors {
        rows.extend(t.to_vec2::<u32>()?);
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    pad_rows(&rows, width, pad_token_id, &device)
}
