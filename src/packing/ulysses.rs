//! Sequence-parallel slicing of a packed sequence.
//!
//! A packed sequence of length `L` is padded to a multiple of the group size
//! `S` and split into `S` contiguous chunks; rank `r` computes on chunk `r`.
//! Gathering concatenates the chunks in rank order and drops the pad.

use std::ops::Range;

use ndarray::{Array1, ArrayView1};

use crate::distributed::Communicator;
use crate::error::CollectiveError;

/// Entries appended so that `len` becomes a multiple of `sp_size`.
pub fn sp_pad_size(len: usize, sp_size: usize) -> usize {
    let sp_size = sp_size.max(1);
    (sp_size - len % sp_size) % sp_size
}

/// The chunk of a padded sequence owned by `sp_rank`.
pub fn local_range(padded_len: usize, sp_size: usize, sp_rank: usize) -> Range<usize> {
    let chunk = padded_len / sp_size.max(1);
    sp_rank * chunk..(sp_rank + 1) * chunk
}

/// Pad `tokens` with `pad_value` to a multiple of `sp_size` and return this
/// rank's chunk along with the pad amount.
pub fn pad_and_slice<T: Copy>(
    tokens: ArrayView1<'_, T>,
    pad_value: T,
    sp_size: usize,
    sp_rank: usize,
) -> (Array1<T>, usize) {
    let pad_size = sp_pad_size(tokens.len(), sp_size);
    let padded_len = tokens.len() + pad_size;
    let range = local_range(padded_len, sp_size, sp_rank);
    let local = range
        .map(|i| if i < tokens.len() { tokens[i] } else { pad_value })
        .collect();
    (local, pad_size)
}

/// Reassemble the full sequence from every rank's chunk and remove exactly
/// `pad_size` trailing entries.
pub fn gather_and_unpad(
    local: ArrayView1<'_, f32>,
    comm: &dyn Communicator,
    pad_size: usize,
) -> Result<Array1<f32>, CollectiveError> {
    let local_vec = local.to_vec();
    let parts = comm.all_gather(&local_vec)?;
    for (rank, part) in parts.iter().enumerate() {
        if part.len() != local_vec.len() {
            return Err(CollectiveError::SizeMismatch {
                rank,
                expected: local_vec.len(),
                got: part.len(),
            });
        }
    }
    let mut full = parts.concat();
    full.truncate(full.len().saturating_sub(pad_size));
    Ok(Array1::from(full))
}

/// Backward of [`gather_and_unpad`]: the slice of the full-sequence gradient
/// that this rank's chunk produced.
///
/// The result is scaled by `sp_size` because every rank of the group
/// back-propagates the same full-sequence loss and the world-wide gradient
/// average divides by the group size again.
pub fn slice_grad(
    full_grad: ArrayView1<'_, f32>,
    sp_size: usize,
    sp_rank: usize,
    pad_size: usize,
) -> Array1<f32> {
    let padded_len = full_grad.len() + pad_size;
    let range = local_range(padded_len, sp_size, sp_rank);
    let scale = sp_size.max(1) as f32;
    range
        .map(|i| if i < full_grad.len() { full_grad[i] * scale } else { 0.0 })
        .collect()
}
