//! Padding-free packing of a micro-batch and sequence-parallel sharding.
//!
//! ```text
//! [b, s] padded ──unpad──▶ [nnz] packed ──pad+slice──▶ [L/S] local chunk
//!      ▲                                                   │ model
//!      └──────pad──── [nnz] ◀──────gather+unpad────────────┘
//! ```
//!
//! Labels for next-token scoring are rolled on the full packed sequence,
//! before slicing, so every chunk scores the token that follows it in the
//! packed order.

pub mod position;
pub mod ulysses;
pub mod unpad;

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

pub use position::PositionIds;
pub use unpad::IndexMapping;

use crate::distributed::{Communicator, NoOpCommunicator};
use crate::error::{CollectiveError, LayoutError};

// ---------------------------------------------------------------------------
// Packed layouts
// ---------------------------------------------------------------------------

/// A micro-batch with its padding removed.
#[derive(Debug, Clone)]
pub struct PackedSequence {
    /// `[nnz]` non-padding token ids in row-major order.
    pub input_ids: Array1<i64>,
    /// `[nnz]` the packed ids rolled left by one.
    pub labels: Array1<i64>,
    /// Packed position ids, one row per axis plane (`[1, nnz]` or `[c, 1, nnz]`).
    pub position_ids: PositionIds,
    /// Where each packed token came from in the padded batch.
    pub mapping: IndexMapping,
}

/// This worker's chunk of a packed sequence.
#[derive(Debug, Clone)]
pub struct SequenceShard {
    /// `[L/S]` token ids of this worker's chunk, pad id 0 at the tail.
    pub input_ids: Array1<i64>,
    /// `[L/S]` labels, cut from the labels rolled over the full sequence.
    pub labels: Array1<i64>,
    /// Position ids of the chunk; pad positions are 0.
    pub position_ids: PositionIds,
    /// Entries appended to the packed sequence before slicing.
    pub pad_size: usize,
}

// ---------------------------------------------------------------------------
// Packer
// ---------------------------------------------------------------------------

/// Packs micro-batches and, with a sequence-parallel group of size `S > 1`,
/// shards them across the group.
#[derive(Clone)]
pub struct SequencePacker {
    sp_group: Arc<dyn Communicator>,
}

impl Default for SequencePacker {
    fn default() -> Self {
        Self::new(Arc::new(NoOpCommunicator))
    }
}

impl SequencePacker {
    /// Packer for the given sequence-parallel group. A group of one disables
    /// sharding.
    pub fn new(sp_group: Arc<dyn Communicator>) -> Self {
        Self { sp_group }
    }

    /// Sequence-parallel degree `S`.
    pub fn sp_size(&self) -> usize {
        self.sp_group.world_size().max(1)
    }

    /// This worker's rank within the sequence-parallel group.
    pub fn sp_rank(&self) -> usize {
        self.sp_group.rank()
    }

    /// Remove padding from `input_ids` and `position_ids`.
    pub fn pack(
        &self,
        input_ids: ArrayView2<'_, i64>,
        attention_mask: ArrayView2<'_, bool>,
        position_ids: &PositionIds,
    ) -> Result<PackedSequence, LayoutError> {
        if input_ids.dim() != attention_mask.dim() {
            return Err(LayoutError::Shape {
                what: "attention_mask".into(),
                expected: input_ids.shape().to_vec(),
                got: attention_mask.shape().to_vec(),
            });
        }
        let mapping = IndexMapping::from_attention_mask(attention_mask);
        let packed_ids = mapping.try_unpad(input_ids)?;
        let position_ids = position_ids.pack(&mapping)?;
        let labels = roll_left(packed_ids.view());
        Ok(PackedSequence {
            input_ids: packed_ids,
            labels,
            position_ids,
            mapping,
        })
    }

    /// Cut this worker's chunk out of a packed sequence. With `S == 1` the
    /// shard is the whole sequence.
    pub fn shard(&self, packed: &PackedSequence) -> SequenceShard {
        let sp_size = self.sp_size();
        if sp_size == 1 {
            return SequenceShard {
                input_ids: packed.input_ids.clone(),
                labels: packed.labels.clone(),
                position_ids: packed.position_ids.clone(),
                pad_size: 0,
            };
        }
        let rank = self.sp_rank();
        let (input_ids, pad_size) = ulysses::pad_and_slice(packed.input_ids.view(), 0, sp_size, rank);
        let (labels, _) = ulysses::pad_and_slice(packed.labels.view(), 0, sp_size, rank);
        let padded_len = packed.input_ids.len() + pad_size;
        let position_ids = packed
            .position_ids
            .pad_tokens(pad_size)
            .slice_tokens(ulysses::local_range(padded_len, sp_size, rank));
        SequenceShard {
            input_ids,
            labels,
            position_ids,
            pad_size,
        }
    }

    /// Reassemble per-token results of every worker's chunk into `[nnz]`.
    pub fn gather(
        &self,
        local: ArrayView1<'_, f32>,
        shard: &SequenceShard,
    ) -> Result<Array1<f32>, CollectiveError> {
        if self.sp_size() == 1 {
            return Ok(local.to_owned());
        }
        ulysses::gather_and_unpad(local, self.sp_group.as_ref(), shard.pad_size)
    }

    /// Gradient of [`SequencePacker::gather`] with respect to the local chunk.
    pub fn shard_grad(&self, full_grad: ArrayView1<'_, f32>, shard: &SequenceShard) -> Array1<f32> {
        if self.sp_size() == 1 {
            return full_grad.to_owned();
        }
        ulysses::slice_grad(full_grad, self.sp_size(), self.sp_rank(), shard.pad_size)
    }

    /// Restore `[nnz]` per-token values to the padded `[b, s]` layout.
    pub fn unpack(
        &self,
        packed: ArrayView1<'_, f32>,
        mapping: &IndexMapping,
    ) -> Result<Array2<f32>, LayoutError> {
        mapping.pad(packed, 0.0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `out[i] = values[(i + 1) % n]`.
pub fn roll_left<T: Copy>(values: ArrayView1<'_, T>) -> Array1<T> {
    let n = values.len();
    (0..n).map(|i| values[(i + 1) % n]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;
    use ndarray::{array, Array3};
    use proptest::prelude::*;

    #[test]
    fn test_pack_rolls_labels_across_samples() {
        let ids = array![[0i64, 7, 8], [9, 10, 0]];
        let mask = array![[false, true, true], [true, true, false]];
        let pos = PositionIds::Single(array![[0i64, 0, 1], [0, 1, 0]]);
        let packed = SequencePacker::default().pack(ids.view(), mask.view(), &pos).unwrap();
        assert_eq!(packed.input_ids, array![7i64, 8, 9, 10]);
        assert_eq!(packed.labels, array![8i64, 9, 10, 7]);
        assert_eq!(packed.position_ids, PositionIds::Single(array![[0i64, 1, 0, 1]]));
    }

    #[test]
    fn test_pack_multi_axis_positions() {
        let ids = array![[1i64, 2], [3, 4]];
        let mask = array![[true, true], [false, true]];
        // [b=2, c=3, s=2]
        let raw = Array3::from_shape_fn((2, 3, 2), |(b, c, t)| (c * 10 + b * 2 + t) as i64);
        let pos = PositionIds::from_batch_layout(raw.into_dyn().view()).unwrap();
        let packed = SequencePacker::default().pack(ids.view(), mask.view(), &pos).unwrap();
        match &packed.position_ids {
            PositionIds::Multi(p) => {
                assert_eq!(p.dim(), (3, 1, 3));
                assert_eq!(p.index_axis(ndarray::Axis(0), 2), array![[20i64, 21, 23]]);
            }
            other => panic!("expected multi-axis ids, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_packed_sequence() {
        let ids = Array2::<i64>::zeros((2, 3));
        let mask = Array2::from_elem((2, 3), false);
        let pos = PositionIds::Single(Array2::zeros((2, 3)));
        let packer = SequencePacker::default();
        let packed = packer.pack(ids.view(), mask.view(), &pos).unwrap();
        assert_eq!(packed.input_ids.len(), 0);
        assert_eq!(packed.labels.len(), 0);
        let shard = packer.shard(&packed);
        let back = packer.unpack(shard.labels.mapv(|v| v as f32).view(), &packed.mapping).unwrap();
        assert_eq!(back, Array2::<f32>::zeros((2, 3)));
    }

    #[test]
    fn test_mismatched_mask_rejected() {
        let ids = Array2::<i64>::zeros((2, 3));
        let mask = Array2::from_elem((2, 4), true);
        let pos = PositionIds::Single(Array2::zeros((2, 3)));
        assert!(SequencePacker::default().pack(ids.view(), mask.view(), &pos).is_err());
    }

    #[test]
    fn test_sharded_pack_gathers_back() {
        let ids = array![[5i64, 6, 7, 0], [8, 9, 0, 0]];
        let mask = ids.mapv(|v| v != 0);
        let pos = PositionIds::Single(array![[0i64, 1, 2, 0], [0, 1, 0, 0]]);
        let group = LocalCommunicator::group(2);
        let gathered: Vec<Array1<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    let (ids, mask, pos) = (&ids, &mask, &pos);
                    s.spawn(move || {
                        let packer = SequencePacker::new(Arc::clone(comm));
                        let packed = packer.pack(ids.view(), mask.view(), pos).unwrap();
                        let shard = packer.shard(&packed);
                        assert_eq!(shard.pad_size, 1);
                        assert_eq!(shard.input_ids.len(), 3);
                        let local = shard.input_ids.mapv(|v| v as f32);
                        packer.gather(local.view(), &shard).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for full in gathered {
            assert_eq!(full, array![5.0f32, 6.0, 7.0, 8.0, 9.0]);
        }
    }

    fn padded_batch() -> impl Strategy<Value = (Array2<i64>, Array2<bool>, usize)> {
        (1usize..5, 1usize..8, 1usize..4).prop_flat_map(|(b, s, axes)| {
            (
                proptest::collection::vec(1i64..100, b * s),
                proptest::collection::vec(any::<bool>(), b * s),
            )
                .prop_map(move |(ids, mask)| {
                    (
                        Array2::from_shape_vec((b, s), ids).unwrap(),
                        Array2::from_shape_vec((b, s), mask).unwrap(),
                        axes,
                    )
                })
        })
    }

    proptest! {
        #[test]
        fn prop_pack_unpack_round_trip((ids, mask, axes) in padded_batch()) {
            let (b, s) = ids.dim();
            let positions = if axes == 1 {
                PositionIds::Single(Array2::from_shape_fn((b, s), |(i, t)| (i * 31 + t) as i64))
            } else {
                let raw = Array3::from_shape_fn((b, axes, s), |(i, c, t)| (i * 31 + c * 7 + t) as i64);
                PositionIds::from_batch_layout(raw.into_dyn().view()).unwrap()
            };
            let packer = SequencePacker::default();
            let packed = packer.pack(ids.view(), mask.view(), &positions).unwrap();

            let ids_back = packed.mapping.pad(packed.input_ids.view(), 0).unwrap();
            for axis in 0..positions.num_axes() {
                let plane = packed.position_ids.plane(axis);
                let pos_back = packed.mapping.pad(plane.row(0), -1).unwrap();
                let original = positions.plane(axis);
                for ((bi, t), &valid) in mask.indexed_iter() {
                    if valid {
                        prop_assert_eq!(pos_back[[bi, t]], original[[bi, t]]);
                    } else {
                        prop_assert_eq!(pos_back[[bi, t]], -1);
                    }
                }
            }
            for ((bi, t), &valid) in mask.indexed_iter() {
                if valid {
                    prop_assert_eq!(ids_back[[bi, t]], ids[[bi, t]]);
                }
            }
        }
    }
}
