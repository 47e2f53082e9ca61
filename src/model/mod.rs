//! Causal language model interface consumed by the actor.
//!
//! This module provides:
//! - [`CausalLm`] -- forward to next-token logits, backward from logit
//!   gradients, named flat parameters and the pretrained configuration used by
//!   the consolidated export.
//! - [`bigram::BigramLm`] -- a small reference model with exact gradients,
//!   used by the demo binary and the tests.
//! - [`processor`] -- tokenizer/processor artifacts written next to an
//!   exported model.

pub mod bigram;
pub mod processor;

use ndarray::{Array1, Array3, ArrayView2, ArrayView3};
use serde_json::Value;

use crate::data::AuxInputs;
use crate::error::LayoutError;
use crate::packing::PositionIds;

pub use bigram::{BigramConfig, BigramLm};
pub use processor::{ProcessingClass, TokenizerFiles};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A named parameter stored flat in row-major order, with its gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Array1<f32>,
    pub grad: Array1<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Array1<f32>) -> Self {
        let grad = Array1::zeros(data.len());
        Self {
            name: name.into(),
            shape,
            data,
            grad,
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A fully materialised tensor of a consolidated model.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Configuration files exported next to consolidated weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PretrainedConfig {
    /// Written as `config.json`.
    pub config: Value,
    /// Written as `generation_config.json` when present.
    pub generation_config: Option<Value>,
}

// ---------------------------------------------------------------------------
// Forward input
// ---------------------------------------------------------------------------

/// Inputs of one forward pass.
///
/// In the padded layout `input_ids` is `[b, s]` and `attention_mask` is set.
/// In the packed layout `input_ids` is `[1, nnz]` (or this worker's chunk of
/// it) and there is no attention mask; sample boundaries are carried by the
/// position ids.
pub struct ModelInput<'a> {
    pub input_ids: ArrayView2<'a, i64>,
    pub position_ids: &'a PositionIds,
    pub attention_mask: Option<ArrayView2<'a, bool>>,
    /// Per-key auxiliary inputs (e.g. image features) of the whole micro-batch.
    pub aux: &'a AuxInputs,
    /// Generation-time KV caching. Always `false` on the training path.
    pub use_cache: bool,
}

// ---------------------------------------------------------------------------
// Model trait
// ---------------------------------------------------------------------------

/// A decoder-only model producing next-token logits.
pub trait CausalLm: Send {
    fn model_type(&self) -> &str;

    fn vocab_size(&self) -> usize;

    /// Logits `[rows, tokens, vocab]`. Implementations keep whatever they need
    /// for the next [`CausalLm::backward`] call.
    fn forward(&mut self, input: &ModelInput<'_>) -> Result<Array3<f32>, LayoutError>;

    /// Accumulate parameter gradients of the last forward pass given the
    /// gradient of the loss with respect to its logits.
    fn backward(&mut self, grad_logits: ArrayView3<'_, f32>) -> Result<(), LayoutError>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// `None` for models that cannot be exported as a standalone snapshot.
    fn pretrained_config(&self) -> Option<PretrainedConfig> {
        None
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(Parameter::numel).sum()
    }

    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.grad.fill(0.0);
        }
    }
}
