use ndarray::{Array1, Array3, ArrayView3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{CausalLm, ModelInput, Parameter, PretrainedConfig};
use crate::error::LayoutError;
use crate::packing::PositionIds;

/// Aux input key whose rows are averaged into a logit bias.
pub const TOKEN_BIAS_KEY: &str = "token_bias";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigramConfig {
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    /// Number of position-id axes the model expects (1, or 3 for M-RoPE style ids).
    pub position_axes: usize,
}

impl Default for BigramConfig {
    fn default() -> Self {
        Self {
            vocab_size: 16,
            max_position_embeddings: 64,
            position_axes: 1,
        }
    }
}

struct SavedInput {
    input_ids: ndarray::Array2<i64>,
    position_ids: PositionIds,
}

/// Bigram model with additive position biases.
///
/// ```text
/// logits[r, t, :] = E[id(r, t)] + sum_a P[a, pos_a(r, t)] + mean(token_bias)
/// ```
///
/// Each token's logits depend only on that token and its positions, so padded
/// and packed forward passes agree exactly on every non-padding position.
pub struct BigramLm {
    config: BigramConfig,
    params: Vec<Parameter>,
    saved: Option<SavedInput>,
}

impl BigramLm {
    pub fn new(config: BigramConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let v = config.vocab_size;
        let mut init = |n: usize| -> Array1<f32> { (0..n).map(|_| rng.gen_range(-0.5f32..0.5)).collect() };
        let embed = Parameter::new("embed_tokens.weight", vec![v, v], init(v * v));
        let rows = config.position_axes * config.max_position_embeddings;
        let position = Parameter::new("position_bias.weight", vec![rows, v], init(rows * v));
        Self {
            config,
            params: vec![embed, position],
            saved: None,
        }
    }

    pub fn config(&self) -> &BigramConfig {
        &self.config
    }

    fn check_input(&self, input: &ModelInput<'_>) -> Result<(), LayoutError> {
        if input.use_cache {
            return Err(LayoutError::Invalid(
                "use_cache must be disabled for training forward passes".into(),
            ));
        }
        let (rows, tokens) = input.input_ids.dim();
        input.position_ids.expect_plane_dim(rows, tokens)?;
        if input.position_ids.num_axes() != self.config.position_axes {
            return Err(LayoutError::Invalid(format!(
                "model expects {} position axes, got {}",
                self.config.position_axes,
                input.position_ids.num_axes()
            )));
        }
        if let Some(mask) = input.attention_mask {
            if mask.dim() != (rows, tokens) {
                return Err(LayoutError::Shape {
                    what: "attention_mask".into(),
                    expected: vec![rows, tokens],
                    got: mask.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    fn token_index(&self, id: i64) -> Result<usize, LayoutError> {
        usize::try_from(id)
            .ok()
            .filter(|&i| i < self.config.vocab_size)
            .ok_or_else(|| {
                LayoutError::Invalid(format!(
                    "token id {} outside vocabulary of {}",
                    id, self.config.vocab_size
                ))
            })
    }

    fn position_row(&self, axis: usize, pos: i64) -> Result<usize, LayoutError> {
        let max = self.config.max_position_embeddings;
        usize::try_from(pos)
            .ok()
            .filter(|&p| p < max)
            .map(|p| axis * max + p)
            .ok_or_else(|| LayoutError::Invalid(format!("position id {} outside [0, {})", pos, max)))
    }

    fn bias(&self, input: &ModelInput<'_>) -> Result<Array1<f32>, LayoutError> {
        let v = self.config.vocab_size;
        match input.aux.get(TOKEN_BIAS_KEY) {
            Some(rows) if rows.ncols() != v => Err(LayoutError::Shape {
                what: TOKEN_BIAS_KEY.into(),
                expected: vec![rows.nrows(), v],
                got: rows.shape().to_vec(),
            }),
            Some(rows) if rows.nrows() > 0 => Ok(rows.sum_axis(ndarray::Axis(0)) / rows.nrows() as f32),
            _ => Ok(Array1::zeros(v)),
        }
    }
}

impl CausalLm for BigramLm {
    fn model_type(&self) -> &str {
        "bigram"
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&mut self, input: &ModelInput<'_>) -> Result<Array3<f32>, LayoutError> {
        self.check_input(input)?;
        let v = self.config.vocab_size;
        let (rows, tokens) = input.input_ids.dim();
        let bias = self.bias(input)?;
        let embed = &self.params[0].data;
        let position = &self.params[1].data;

        let mut logits = Array3::<f32>::zeros((rows, tokens, v));
        for r in 0..rows {
            for t in 0..tokens {
                let token = self.token_index(input.input_ids[[r, t]])?;
                let mut out = logits.slice_mut(ndarray::s![r, t, ..]);
                out.assign(&embed.slice(ndarray::s![token * v..(token + 1) * v]));
                out += &bias;
                for axis in 0..self.config.position_axes {
                    let row = self.position_row(axis, input.position_ids.plane(axis)[[r, t]])?;
                    out += &position.slice(ndarray::s![row * v..(row + 1) * v]);
                }
            }
        }

        self.saved = Some(SavedInput {
            input_ids: input.input_ids.to_owned(),
            position_ids: input.position_ids.clone(),
        });
        Ok(logits)
    }

    fn backward(&mut self, grad_logits: ArrayView3<'_, f32>) -> Result<(), LayoutError> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| LayoutError::Invalid("backward called without a forward pass".into()))?;
        let v = self.config.vocab_size;
        let (rows, tokens) = saved.input_ids.dim();
        if grad_logits.dim() != (rows, tokens, v) {
            return Err(LayoutError::Shape {
                what: "grad_logits".into(),
                expected: vec![rows, tokens, v],
                got: grad_logits.shape().to_vec(),
            });
        }

        for r in 0..rows {
            for t in 0..tokens {
                let g = grad_logits.slice(ndarray::s![r, t, ..]);
                let token = self.token_index(saved.input_ids[[r, t]])?;
                let mut embed_grad = self.params[0].grad.slice_mut(ndarray::s![token * v..(token + 1) * v]);
                embed_grad += &g;
                for axis in 0..self.config.position_axes {
                    let row = self.position_row(axis, saved.position_ids.plane(axis)[[r, t]])?;
                    let mut pos_grad = self.params[1].grad.slice_mut(ndarray::s![row * v..(row + 1) * v]);
                    pos_grad += &g;
                }
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn pretrained_config(&self) -> Option<PretrainedConfig> {
        Some(PretrainedConfig {
            config: json!({
                "model_type": "bigram",
                "architectures": ["BigramLm"],
                "vocab_size": self.config.vocab_size,
                "max_position_embeddings": self.config.max_position_embeddings,
                "position_axes": self.config.position_axes,
            }),
            generation_config: Some(json!({
                "do_sample": true,
                "temperature": 1.0,
                "max_new_tokens": self.config.max_position_embeddings,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::AuxInputs;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn small() -> BigramLm {
        BigramLm::new(
            BigramConfig {
                vocab_size: 5,
                max_position_embeddings: 8,
                position_axes: 1,
            },
            7,
        )
    }

    #[test]
    fn test_forward_shape_and_locality() {
        let mut model = small();
        let ids = array![[1i64, 2, 3]];
        let pos = PositionIds::Single(array![[0i64, 1, 2]]);
        let aux = AuxInputs::new();
        let logits = model
            .forward(&ModelInput {
                input_ids: ids.view(),
                position_ids: &pos,
                attention_mask: None,
                aux: &aux,
                use_cache: false,
            })
            .unwrap();
        assert_eq!(logits.dim(), (1, 3, 5));

        // Same token and position in another row gives identical logits.
        let ids2 = array![[4i64, 2]];
        let pos2 = PositionIds::Single(array![[5i64, 1]]);
        let logits2 = model
            .forward(&ModelInput {
                input_ids: ids2.view(),
                position_ids: &pos2,
                attention_mask: None,
                aux: &aux,
                use_cache: false,
            })
            .unwrap();
        assert_eq!(logits.slice(ndarray::s![0, 1, ..]), logits2.slice(ndarray::s![0, 1, ..]));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut model = small();
        let ids = array![[1i64, 1, 3]];
        let pos = PositionIds::Single(array![[0i64, 1, 2]]);
        let aux = AuxInputs::new();
        let input = ModelInput {
            input_ids: ids.view(),
            position_ids: &pos,
            attention_mask: None,
            aux: &aux,
            use_cache: false,
        };
        // Loss = sum of logits weighted by w.
        let w = Array3::from_shape_fn((1, 3, 5), |(_, t, k)| (t * 5 + k) as f32 * 0.1);
        model.forward(&input).unwrap();
        model.backward(w.view()).unwrap();
        let analytic = model.parameters()[0].grad[7];

        let eps = 1e-2;
        let loss_at = |delta: f32, model: &mut BigramLm| {
            model.parameters_mut()[0].data[7] += delta;
            let l = (model.forward(&input).unwrap() * &w).sum();
            model.parameters_mut()[0].data[7] -= delta;
            l
        };
        let numeric = (loss_at(eps, &mut model) - loss_at(-eps, &mut model)) / (2.0 * eps);
        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-3);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut model = small();
        let aux = AuxInputs::new();
        let ids = array![[9i64]];
        let pos = PositionIds::Single(array![[0i64]]);
        let input = ModelInput {
            input_ids: ids.view(),
            position_ids: &pos,
            attention_mask: None,
            aux: &aux,
            use_cache: false,
        };
        assert!(model.forward(&input).is_err());

        let ids = array![[1i64]];
        let input = ModelInput {
            input_ids: ids.view(),
            position_ids: &pos,
            attention_mask: None,
            aux: &aux,
            use_cache: true,
        };
        assert!(model.forward(&input).is_err());
        assert!(model.backward(Array3::zeros((1, 1, 5)).view()).is_err());
    }

    #[test]
    fn test_token_bias_aux_input() {
        let mut model = small();
        let ids = array![[1i64]];
        let pos = PositionIds::Single(array![[0i64]]);
        let run = |model: &mut BigramLm, aux: &AuxInputs| {
            model
                .forward(&ModelInput {
                    input_ids: ids.view(),
                    position_ids: &pos,
                    attention_mask: None,
                    aux,
                    use_cache: false,
                })
                .unwrap()
        };
        let plain = run(&mut model, &AuxInputs::new());
        let mut aux = AuxInputs::new();
        aux.insert(TOKEN_BIAS_KEY.into(), Array2::from_elem((2, 5), 1.0));
        let biased = run(&mut model, &aux);
        assert_abs_diff_eq!(biased[[0, 0, 3]] - plain[[0, 0, 3]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pretrained_config() {
        let config = small().pretrained_config().unwrap();
        assert_eq!(config.config["vocab_size"], 5);
        assert!(config.generation_config.is_some());
    }
}
