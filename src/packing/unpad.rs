use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::LayoutError;

/// Packed position -> original `(sample, position)` mapping.
///
/// Built from an attention mask: `indices` holds the row-major flat index
/// `b * seqlen + t` of every non-padding position, in order, so the mapping is
/// a bijection between `0..nnz` and the set of non-padding positions.
/// `cu_seqlens[b]..cu_seqlens[b + 1]` is the packed segment of sample `b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMapping {
    indices: Vec<usize>,
    cu_seqlens: Vec<usize>,
    batch_size: usize,
    seqlen: usize,
}

impl IndexMapping {
    pub fn from_attention_mask(attention_mask: ArrayView2<'_, bool>) -> Self {
        let (batch_size, seqlen) = attention_mask.dim();
        let mut indices = Vec::with_capacity(attention_mask.len());
        let mut cu_seqlens = Vec::with_capacity(batch_size + 1);
        cu_seqlens.push(0);
        for (b, row) in attention_mask.outer_iter().enumerate() {
            for (t, &valid) in row.iter().enumerate() {
                if valid {
                    indices.push(b * seqlen + t);
                }
            }
            cu_seqlens.push(indices.len());
        }
        Self {
            indices,
            cu_seqlens,
            batch_size,
            seqlen,
        }
    }

    /// Number of non-padding tokens.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seqlen(&self) -> usize {
        self.seqlen
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn cu_seqlens(&self) -> &[usize] {
        &self.cu_seqlens
    }

    pub fn max_seqlen(&self) -> usize {
        self.cu_seqlens
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0)
    }

    /// Original `(sample, position)` of a packed position.
    pub fn origin(&self, packed_pos: usize) -> Option<(usize, usize)> {
        self.indices
            .get(packed_pos)
            .map(|&flat| (flat / self.seqlen, flat % self.seqlen))
    }

    fn expect_dim(&self, what: &str, dim: (usize, usize)) -> Result<(), LayoutError> {
        if dim != (self.batch_size, self.seqlen) {
            return Err(LayoutError::Shape {
                what: what.into(),
                expected: vec![self.batch_size, self.seqlen],
                got: vec![dim.0, dim.1],
            });
        }
        Ok(())
    }

    /// Gather the non-padding entries of a `[b, s]` tensor into `[nnz]`.
    ///
    /// The caller guarantees `values` is `[b, s]`; see [`IndexMapping::try_unpad`].
    pub(crate) fn unpad<T: Copy>(&self, values: ArrayView2<'_, T>) -> Array1<T> {
        let seqlen = self.seqlen.max(1);
        self.indices
            .iter()
            .map(|&flat| values[[flat / seqlen, flat % seqlen]])
            .collect()
    }

    /// Gather the non-padding entries of a `[b, s]` tensor into `[nnz]`.
    pub fn try_unpad<T: Copy>(&self, values: ArrayView2<'_, T>) -> Result<Array1<T>, LayoutError> {
        self.expect_dim("unpad input", values.dim())?;
        Ok(self.unpad(values))
    }

    /// Scatter `[nnz]` packed values back into a `[b, s]` tensor, filling
    /// padding positions with `fill`.
    pub fn pad<T: Copy>(&self, packed: ArrayView1<'_, T>, fill: T) -> Result<Array2<T>, LayoutError> {
        if packed.len() != self.nnz() {
            return Err(LayoutError::Shape {
                what: "packed values".into(),
                expected: vec![self.nnz()],
                got: vec![packed.len()],
            });
        }
        let mut out = Array2::from_elem((self.batch_size, self.seqlen), fill);
        for (&flat, &value) in self.indices.iter().zip(packed.iter()) {
            out[[flat / self.seqlen, flat % self.seqlen]] = value;
        }
        Ok(out)
    }
}
