//! Reconciling the padded `response_mask` with the `compact_response_mask`.
//!
//! Both masks select the same response tokens in the same left-to-right order;
//! the compact one drops the padding in between. Values move between the two
//! layouts by walking the true positions of each mask in row-major order.

use ndarray::{Array2, ArrayView2};

use crate::error::LayoutError;

/// Number of true entries in a mask.
pub fn count_true(mask: ArrayView2<'_, bool>) -> usize {
    mask.iter().filter(|&&m| m).count()
}

fn row_counts(mask: ArrayView2<'_, bool>) -> Vec<usize> {
    mask.outer_iter()
        .map(|row| row.iter().filter(|&&m| m).count())
        .collect()
}

/// Check that both masks cover the same samples and select the same number of
/// tokens in every sample.
pub fn validate_mask_pair(
    response_mask: ArrayView2<'_, bool>,
    compact_response_mask: ArrayView2<'_, bool>,
) -> Result<(), LayoutError> {
    if response_mask.nrows() != compact_response_mask.nrows() {
        return Err(LayoutError::LeadingDim {
            field: "compact_response_mask".into(),
            expected: response_mask.nrows(),
            got: compact_response_mask.nrows(),
        });
    }
    let padded = row_counts(response_mask);
    let compact = row_counts(compact_response_mask);
    for (sample, (&response, &compact)) in padded.iter().zip(compact.iter()).enumerate() {
        if response != compact {
            return Err(LayoutError::MaskCardinality {
                sample,
                response,
                compact,
            });
        }
    }
    Ok(())
}

/// Build a left-aligned compact mask whose width is the longest response.
pub fn compact_mask_from_response(response_mask: ArrayView2<'_, bool>) -> Array2<bool> {
    let counts = row_counts(response_mask);
    let width = counts.iter().copied().max().unwrap_or(0);
    Array2::from_shape_fn((counts.len(), width), |(b, t)| t < counts[b])
}

/// Scatter the padded-layout values selected by `response_mask` into the
/// compact positions marked by `compact_response_mask`. Unselected compact
/// positions are zero.
pub fn scatter_to_compact(
    values: ArrayView2<'_, f32>,
    response_mask: ArrayView2<'_, bool>,
    compact_response_mask: ArrayView2<'_, bool>,
) -> Result<Array2<f32>, LayoutError> {
    if values.dim() != response_mask.dim() {
        return Err(LayoutError::Shape {
            what: "log_probs".into(),
            expected: response_mask.shape().to_vec(),
            got: values.shape().to_vec(),
        });
    }
    validate_mask_pair(response_mask, compact_response_mask)?;

    let mut compact = Array2::<f32>::zeros(compact_response_mask.raw_dim());
    let sources = values
        .iter()
        .zip(response_mask.iter())
        .filter_map(|(&v, &m)| m.then_some(v));
    let targets = compact
        .iter_mut()
        .zip(compact_response_mask.iter())
        .filter_map(|(slot, &m)| m.then_some(slot));
    for (slot, value) in targets.zip(sources) {
        *slot = value;
    }
    Ok(compact)
}

/// Inverse of [`scatter_to_compact`]: move compact values back to the padded
/// positions selected by `response_mask`. Other positions are zero.
pub fn gather_from_compact(
    compact: ArrayView2<'_, f32>,
    response_mask: ArrayView2<'_, bool>,
    compact_response_mask: ArrayView2<'_, bool>,
) -> Result<Array2<f32>, LayoutError> {
    if compact.dim() != compact_response_mask.dim() {
        return Err(LayoutError::Shape {
            what: "compact values".into(),
            expected: compact_response_mask.shape().to_vec(),
            got: compact.shape().to_vec(),
        });
    }
    validate_mask_pair(response_mask, compact_response_mask)?;

    let mut padded = Array2::<f32>::zeros(response_mask.raw_dim());
    let sources = compact
        .iter()
        .zip(compact_response_mask.iter())
        .filter_map(|(&v, &m)| m.then_some(v));
    let targets = padded
        .iter_mut()
        .zip(response_mask.iter())
        .filter_map(|(slot, &m)| m.then_some(slot));
    for (slot, value) in targets.zip(sources) {
        *slot = value;
    }
    Ok(padded)
}
