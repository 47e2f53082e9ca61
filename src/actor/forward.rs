//! One forward (and explicit backward) pass over a micro-batch.
//!
//! In the padded layout the model sees `[b, s]` rows and scores
//! `input_ids` rolled left by one. In the padding-free layout the batch is
//! packed to `[1, nnz]`, optionally sharded across the sequence-parallel
//! group, and the gathered per-token log-probs are padded back to `[b, s]`.
//! Both end in the compact `[b, Lc]` layout the loss works in.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use ndarray::{concatenate, Array2, Array3, Axis};
use tracing::{debug, info};

use super::log_probs::{log_probs_from_logits, logits_grad};
use crate::config::ActorConfig;
use crate::data::{gather_from_compact, scatter_to_compact, AuxInputs, Batch};
use crate::distributed::{Communicator, ShardedModel, WorkerEnv};
use crate::error::{CollectiveError, LayoutError};
use crate::model::{CausalLm, ModelInput};
use crate::packing::{IndexMapping, PositionIds, SequencePacker, SequenceShard};

// ---------------------------------------------------------------------------
// Inputs and tape
// ---------------------------------------------------------------------------

/// Batch fields read by every forward pass.
pub const FORWARD_KEYS: &[&str] = &[
    "response_mask",
    "input_ids",
    "attention_mask",
    "position_ids",
    "compact_response_mask",
];
/// Per-sample non-tensor field holding multi-modal model inputs.
pub const MULTI_MODAL_KEY: &str = "multi_modal_inputs";

/// Everything the explicit backward of one micro-batch needs.
pub struct ForwardTape {
    temperature: f32,
    /// `[b, s]` positions whose next-token log-prob was scored.
    response_mask: Array2<bool>,
    /// `[b, Lc]` layout of the returned log-probs.
    compact_response_mask: Array2<bool>,
    /// Softmax of the scaled logits for the rows the model actually saw.
    probs: Array3<f32>,
    /// Labels of those rows, `[b, s]` padded or `[1, L/S]` packed.
    labels: Array2<i64>,
    layout: TapeLayout,
}

enum TapeLayout {
    Padded,
    Packed { mapping: IndexMapping, shard: SequenceShard },
}

/// `out[b, t] = ids[b, (t + 1) % s]` for every row.
fn roll_rows(ids: &Array2<i64>) -> Array2<i64> {
    let (_, s) = ids.dim();
    Array2::from_shape_fn(ids.raw_dim(), |(b, t)| ids[[b, (t + 1) % s]])
}

/// Concatenate each multi-modal input key across the samples of a micro-batch.
pub fn collect_aux_inputs(batch: &Batch) -> Result<AuxInputs, LayoutError> {
    let mut grouped: std::collections::BTreeMap<String, Vec<ndarray::ArrayView2<'_, f32>>> = Default::default();
    for sample in batch.non_tensor(MULTI_MODAL_KEY).unwrap_or(&[]) {
        for (key, value) in sample {
            grouped.entry(key.clone()).or_default().push(value.view());
        }
    }
    grouped
        .into_iter()
        .map(|(key, views)| {
            let joined = concatenate(Axis(0), &views).map_err(|e| {
                LayoutError::Invalid(format!("cannot concatenate multi-modal input `{key}`: {e}"))
            })?;
            Ok((key, joined))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Actor core
// ---------------------------------------------------------------------------

/// The forward machinery shared by the reference and the trainable policy.
pub struct ActorCore<M: CausalLm> {
    config: ActorConfig,
    /// Data-parallel sharded model.
    model: ShardedModel<M>,
    /// Packing and sequence-parallel sharding for the padding-free layout.
    packer: SequencePacker,
    /// Launcher rank information; gates progress logging.
    worker: WorkerEnv,
}

impl<M: CausalLm> ActorCore<M> {
    /// Shard `model` over `comm` and pack over `sp_group`. Collective over `comm`.
    pub fn new(
        config: ActorConfig,
        model: M,
        comm: Arc<dyn Communicator>,
        sp_group: Arc<dyn Communicator>,
        worker: WorkerEnv,
    ) -> Result<Self> {
        config.validate()?;
        let group = sp_group.world_size().max(1);
        if group != config.ulysses_size {
            return Err(CollectiveError::GroupSize {
                group,
                configured: config.ulysses_size,
            }
            .into());
        }
        if config.ulysses_size > 1 && !config.padding_free {
            bail!("sequence parallelism requires padding_free");
        }
        let model = ShardedModel::new(model, comm)?;
        Ok(Self {
            config,
            model,
            packer: SequencePacker::new(sp_group),
            worker,
        })
    }

    pub fn config(&self) -> &ActorConfig {
        &self.config
    }

    /// The sharded model this core runs.
    pub fn model(&self) -> &ShardedModel<M> {
        &self.model
    }

    /// Mutable sharded model, for optimizer steps and checkpoint restores.
    pub fn model_mut(&mut self) -> &mut ShardedModel<M> {
        &mut self.model
    }

    pub fn worker(&self) -> WorkerEnv {
        self.worker
    }

    /// Progress logs are emitted by rank 0 only, and only when enabled.
    pub(crate) fn log_progress(&self) -> bool {
        self.config.log_progress && self.worker.is_rank_zero()
    }

    /// Compact log-probabilities `[b, Lc]` of one micro-batch. With
    /// `keep_tape` the returned tape feeds [`ActorCore::backward`].
    pub fn forward_micro_batch(
        &mut self,
        batch: &Batch,
        temperature: f32,
        keep_tape: bool,
    ) -> Result<(Array2<f32>, Option<ForwardTape>)> {
        let input_ids = batch.int2("input_ids")?.to_owned();
        let attention_mask = batch.mask2("attention_mask")?;
        let response_mask = batch.mask2("response_mask")?;
        let compact_response_mask = batch.mask2("compact_response_mask")?;
        let position_ids = PositionIds::from_batch_layout(batch.int_dyn("position_ids")?)?;
        let aux = collect_aux_inputs(batch)?;

        let (b, s) = input_ids.dim();
        for (name, mask) in [("attention_mask", &attention_mask), ("response_mask", &response_mask)] {
            if mask.dim() != (b, s) {
                return Err(LayoutError::Shape {
                    what: name.into(),
                    expected: vec![b, s],
                    got: mask.shape().to_vec(),
                }
                .into());
            }
        }
        position_ids.expect_plane_dim(b, s)?;

        let (full_log_probs, probs, labels, layout) = if self.config.padding_free {
            let packed = self.packer.pack(input_ids.view(), attention_mask.view(), &position_ids)?;
            let shard = self.packer.shard(&packed);
            let local_ids = shard.input_ids.view().insert_axis(Axis(0));
            let local_labels = shard.labels.clone().insert_axis(Axis(0));
            let logits = self.model.module_mut().forward(&ModelInput {
                input_ids: local_ids,
                position_ids: &shard.position_ids,
                attention_mask: None,
                aux: &aux,
                use_cache: false,
            })?;
            let out = log_probs_from_logits(logits.view(), local_labels.view(), temperature)?;
            let local = out.log_probs.index_axis(Axis(0), 0);
            let gathered = self.packer.gather(local, &shard)?;
            let full = self.packer.unpack(gathered.view(), &packed.mapping)?;
            debug!(
                nnz = packed.mapping.nnz(),
                local_tokens = shard.input_ids.len(),
                pad_size = shard.pad_size,
                "Packed forward"
            );
            let layout = TapeLayout::Packed {
                mapping: packed.mapping,
                shard,
            };
            (full, out.probs, local_labels, layout)
        } else {
            let labels = roll_rows(&input_ids);
            let logits = self.model.module_mut().forward(&ModelInput {
                input_ids: input_ids.view(),
                position_ids: &position_ids,
                attention_mask: Some(attention_mask.view()),
                aux: &aux,
                use_cache: false,
            })?;
            let out = log_probs_from_logits(logits.view(), labels.view(), temperature)?;
            (out.log_probs, out.probs, labels, TapeLayout::Padded)
        };

        let compact = scatter_to_compact(full_log_probs.view(), response_mask.view(), compact_response_mask.view())?;
        let tape = keep_tape.then(|| ForwardTape {
            temperature,
            response_mask,
            compact_response_mask,
            probs,
            labels,
            layout,
        });
        Ok((compact, tape))
    }

    /// Accumulate replica gradients given `d loss / d compact log-probs`.
    pub fn backward(&mut self, tape: ForwardTape, grad_compact: &Array2<f32>) -> Result<()> {
        let grad_full = gather_from_compact(
            grad_compact.view(),
            tape.response_mask.view(),
            tape.compact_response_mask.view(),
        )?;
        let grad_rows = match &tape.layout {
            TapeLayout::Padded => grad_full,
            TapeLayout::Packed { mapping, shard } => {
                let packed = mapping.try_unpad(grad_full.view())?;
                self.packer
                    .shard_grad(packed.view(), shard)
                    .insert_axis(Axis(0))
            }
        };
        let grad_logits = logits_grad(tape.probs.view(), tape.labels.view(), grad_rows.view(), tape.temperature)?;
        self.model.module_mut().backward(grad_logits.view())?;
        Ok(())
    }

    /// Compact log-probabilities of every sample, computed without a tape in
    /// micro-batches of the experience size.
    pub fn compute_log_prob(&mut self, data: &Batch) -> Result<Array2<f32>> {
        let temperature = data.temperature()?;
        let micro_batches = data
            .select(FORWARD_KEYS, &[MULTI_MODAL_KEY])?
            .split(self.config.micro_batch_size_per_device_for_experience)?;
        let progress = self.log_progress();
        if progress {
            info!(micro_batches = micro_batches.len(), "Computing log probs");
        }
        let start = Instant::now();

        let mut parts = Vec::with_capacity(micro_batches.len());
        for micro_batch in &micro_batches {
            let (log_probs, _) = self.forward_micro_batch(micro_batch, temperature, false)?;
            parts.push(log_probs);
        }
        let log_probs = concat_compact(&parts);

        if progress && !micro_batches.is_empty() {
            let elapsed = start.elapsed().as_secs_f64();
            info!(
                micro_batches = micro_batches.len(),
                secs_per_micro_batch = elapsed / micro_batches.len() as f64,
                "Computed log probs"
            );
        }
        Ok(log_probs)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stack compact rows of several micro-batches, right-padding narrower ones
/// with zeros.
fn concat_compact(parts: &[Array2<f32>]) -> Array2<f32> {
    let rows: usize = parts.iter().map(Array2::nrows).sum();
    let width = parts.iter().map(Array2::ncols).max().unwrap_or(0);
    let mut out = Array2::<f32>::zeros((rows, width));
    let mut offset = 0;
    for part in parts {
        let (r, c) = part.dim();
        out.slice_mut(ndarray::s![offset..offset + r, ..c]).assign(part);
        offset += r;
    }
    out
}
