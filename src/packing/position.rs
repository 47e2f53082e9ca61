use std::ops::Range;

use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewD, Axis, Ix2, Ix3};

use super::IndexMapping;
use crate::error::LayoutError;

/// Position ids in axis-first layout.
///
/// Single-axis ids are `[rows, seqlen]`. Multi-axis ids (e.g. the 3-axis
/// temporal/height/width scheme of vision-language models) are
/// `[axes, rows, seqlen]`. Batches store multi-axis ids sample-first as
/// `[b, axes, s]`; [`PositionIds::from_batch_layout`] transposes them.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionIds {
    Single(Array2<i64>),
    Multi(Array3<i64>),
}

impl PositionIds {
    /// Convert a `position_ids` batch field (`[b, s]` or `[b, c, s]`).
    pub fn from_batch_layout(field: ArrayViewD<'_, i64>) -> Result<Self, LayoutError> {
        let rank_error = |got: usize| LayoutError::Rank {
            what: "position_ids".into(),
            expected: "2 or 3".into(),
            got,
        };
        match field.ndim() {
            2 => {
                let ids = field
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| rank_error(2))?;
                Ok(Self::Single(ids.to_owned()))
            }
            3 => {
                let ids = field
                    .into_dimensionality::<Ix3>()
                    .map_err(|_| rank_error(3))?;
                let transposed = ids.permuted_axes([1, 0, 2]);
                Ok(Self::Multi(transposed.as_standard_layout().into_owned()))
            }
            n => Err(rank_error(n)),
        }
    }

    pub fn num_axes(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(p) => p.len_of(Axis(0)),
        }
    }

    /// `(rows, seqlen)` of every axis plane.
    pub fn plane_dim(&self) -> (usize, usize) {
        match self {
            Self::Single(p) => p.dim(),
            Self::Multi(p) => {
                let (_, rows, seqlen) = p.dim();
                (rows, seqlen)
            }
        }
    }

    /// One axis plane, `[rows, seqlen]`.
    pub fn plane(&self, axis: usize) -> ArrayView2<'_, i64> {
        match self {
            Self::Single(p) => p.view(),
            Self::Multi(p) => p.index_axis(Axis(0), axis),
        }
    }

    /// Fail unless every plane is `[rows, seqlen]`.
    pub fn expect_plane_dim(&self, rows: usize, seqlen: usize) -> Result<(), LayoutError> {
        if self.plane_dim() != (rows, seqlen) {
            let (r, t) = self.plane_dim();
            return Err(LayoutError::Shape {
                what: "position_ids".into(),
                expected: vec![rows, seqlen],
                got: vec![r, t],
            });
        }
        Ok(())
    }

    fn map_planes(&self, f: impl Fn(ArrayView2<'_, i64>) -> Array2<i64>) -> Self {
        match self {
            Self::Single(p) => Self::Single(f(p.view())),
            Self::Multi(p) => {
                let planes: Vec<Array2<i64>> = p.outer_iter().map(&f).collect();
                let (rows, cols) = planes.first().map(|p| p.dim()).unwrap_or((0, 0));
                Self::Multi(Array3::from_shape_fn(
                    (planes.len(), rows, cols),
                    |(a, r, t)| planes[a][[r, t]],
                ))
            }
        }
    }

    /// Keep only the non-padding positions, concatenated into a single row.
    pub fn pack(&self, mapping: &IndexMapping) -> Result<Self, LayoutError> {
        self.expect_plane_dim(mapping.batch_size(), mapping.seqlen())?;
        Ok(self.map_planes(|plane| {
            let packed = mapping.unpad(plane);
            packed.insert_axis(Axis(0))
        }))
    }

    /// Slice the token axis of every plane.
    pub fn slice_tokens(&self, range: Range<usize>) -> Self {
        self.map_planes(|plane| plane.slice(s![.., range.clone()]).to_owned())
    }

    /// Append `count` zero positions to every row.
    pub fn pad_tokens(&self, count: usize) -> Self {
        if count == 0 {
            return self.clone();
        }
        self.map_planes(|plane| {
            let (rows, cols) = plane.dim();
            Array2::from_shape_fn((rows, cols + count), |(r, t)| {
                if t < cols {
                    plane[[r, t]]
                } else {
                    0
                }
            })
        })
    }
}
