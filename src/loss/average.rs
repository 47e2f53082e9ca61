use ndarray::{Array2, ArrayView2, Zip};

use crate::config::LossAvgMode;

const EPS: f64 = 1e-8;

/// `sum(mask * values) / sum(mask)`, zero for an empty mask.
pub fn masked_mean(values: ArrayView2<'_, f32>, mask: ArrayView2<'_, bool>) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    Zip::from(values).and(mask).for_each(|&v, &m| {
        if m {
            sum += f64::from(v);
            count += 1;
        }
    });
    (sum / (count as f64 + EPS)) as f32
}

/// Per-token weights `w` such that the averaged value is `sum(w * values)`.
/// Also the gradient of the average with respect to each value.
pub fn average_weights(mask: ArrayView2<'_, bool>, mode: LossAvgMode) -> Array2<f32> {
    match mode {
        LossAvgMode::Token => {
            let count = mask.iter().filter(|&&m| m).count() as f64;
            let w = (1.0 / (count + EPS)) as f32;
            mask.mapv(|m| if m { w } else { 0.0 })
        }
        LossAvgMode::Seq => {
            let batch = mask.nrows().max(1) as f64;
            let mut weights = Array2::zeros(mask.raw_dim());
            for (mut w_row, m_row) in weights.outer_iter_mut().zip(mask.outer_iter()) {
                let count = m_row.iter().filter(|&&m| m).count() as f64;
                let w = (1.0 / ((count + EPS) * batch)) as f32;
                Zip::from(&mut w_row).and(&m_row).for_each(|w_t, &m| {
                    if m {
                        *w_t = w;
                    }
                });
            }
            weights
        }
    }
}

/// Reduce per-token values with the configured averaging mode. Masked-out
/// positions never contribute, even when they hold NaN.
pub fn average_loss(values: ArrayView2<'_, f32>, mask: ArrayView2<'_, bool>, mode: LossAvgMode) -> f32 {
    let weights = average_weights(mask, mode);
    let mut total = 0.0f64;
    Zip::from(values).and(&weights).and(mask).for_each(|&v, &w, &m| {
        if m {
            total += f64::from(w) * f64::from(v);
        }
    });
    total as f32
}
