//! Temperature-scaled next-token log-probabilities and their logit gradient.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::error::LayoutError;

/// Log-probabilities of the labels plus the softmax kept for the backward.
#[derive(Debug, Clone)]
pub struct TokenLogProbs {
    /// `[rows, tokens]`
    pub log_probs: Array2<f32>,
    /// `[rows, tokens, vocab]` softmax of `logits / temperature`.
    pub probs: Array3<f32>,
}

fn label_index(label: i64, vocab: usize) -> Result<usize, LayoutError> {
    usize::try_from(label)
        .ok()
        .filter(|&i| i < vocab)
        .ok_or_else(|| LayoutError::Invalid(format!("label {} outside vocabulary of {}", label, vocab)))
}

fn check_labels(logits_dim: (usize, usize, usize), labels: ArrayView2<'_, i64>) -> Result<(), LayoutError> {
    let (rows, tokens, _) = logits_dim;
    if labels.dim() != (rows, tokens) {
        return Err(LayoutError::Shape {
            what: "labels".into(),
            expected: vec![rows, tokens],
            got: labels.shape().to_vec(),
        });
    }
    Ok(())
}

/// `log softmax(logits / temperature)[label]` for every position.
pub fn log_probs_from_logits(
    logits: ArrayView3<'_, f32>,
    labels: ArrayView2<'_, i64>,
    temperature: f32,
) -> Result<TokenLogProbs, LayoutError> {
    check_labels(logits.dim(), labels)?;
    let vocab = logits.len_of(Axis(2));
    let mut probs = logits.mapv(|z| z / temperature);
    let mut log_probs = Array2::<f32>::zeros(labels.raw_dim());

    for ((mut row, out), &label) in probs
        .lanes_mut(Axis(2))
        .into_iter()
        .zip(log_probs.iter_mut())
        .zip(labels.iter())
    {
        let target = label_index(label, vocab)?;
        let max = row.fold(f32::NEG_INFINITY, |m, &z| m.max(z));
        let sum: f32 = row.iter().map(|&z| (z - max).exp()).sum();
        let lse = max + sum.ln();
        *out = row[target] - lse;
        row.mapv_inplace(|z| (z - lse).exp());
    }
    Ok(TokenLogProbs { log_probs, probs })
}

/// Gradient of a loss with respect to the raw logits given its gradient with
/// respect to the label log-probabilities:
/// `g * (onehot(label) - softmax) / temperature`.
pub fn logits_grad(
    probs: ArrayView3<'_, f32>,
    labels: ArrayView2<'_, i64>,
    grad_log_probs: ArrayView2<'_, f32>,
    temperature: f32,
) -> Result<Array3<f32>, LayoutError> {
    check_labels(probs.dim(), labels)?;
    if grad_log_probs.dim() != labels.dim() {
        return Err(LayoutError::Shape {
            what: "grad_log_probs".into(),
            expected: labels.shape().to_vec(),
            got: grad_log_probs.shape().to_vec(),
        });
    }
    let vocab = probs.len_of(Axis(2));
    let mut grad = Array3::<f32>::zeros(probs.raw_dim());
    for (((mut out, p), &label), &g) in grad
        .lanes_mut(Axis(2))
        .into_iter()
        .zip(probs.lanes(Axis(2)))
        .zip(labels.iter())
        .zip(grad_log_probs.iter())
    {
        if g == 0.0 {
            continue;
        }
        let target = label_index(label, vocab)?;
        let scale = g / temperature;
        Zip::from(&mut out).and(&p).for_each(|o, &pv| *o = -scale * pv);
        out[target] += scale;
    }
    Ok(grad)
}
