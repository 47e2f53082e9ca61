use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::Array2;
use tracing::{debug, info, warn};

use super::forward::{ActorCore, FORWARD_KEYS, MULTI_MODAL_KEY};
use super::{consolidate, model_shard_of};
use crate::checkpoint::{
    Checkpointable, ConsolidatedModel, ExtraState, ModelShardState, OptimizerShardState, WorkerRng,
};
use crate::config::OptimConfig;
use crate::data::{Batch, MetricsLog};
use crate::error::ExportError;
use crate::loss::{PolicyLossEngine, PolicyLossInput};
use crate::model::CausalLm;
use crate::optim::{build_scheduler, AdamW, LrScheduler, Optimizer};

// ---------------------------------------------------------------------------
// Update loop
// ---------------------------------------------------------------------------

/// The policy being optimised: forward core plus optimizer, LR schedule and
/// the worker RNG used to shuffle mini-batches.
pub struct TrainablePolicy<M: CausalLm> {
    core: ActorCore<M>,
    loss: PolicyLossEngine,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    rng: WorkerRng,
}

impl<M: CausalLm> TrainablePolicy<M> {
    pub fn new(core: ActorCore<M>, optim: &OptimConfig) -> Self {
        let loss = PolicyLossEngine::from_config(core.config());
        let scheduler = build_scheduler(optim);
        let mut optimizer = AdamW::new(core.model().flat_range().len(), optim);
        optimizer.set_lr(scheduler.get_lr());
        let rng = WorkerRng::new(optim.seed, core.model().shard().rank);
        Self {
            core,
            loss,
            optimizer: Box::new(optimizer),
            scheduler,
            rng,
        }
    }

    pub fn core(&self) -> &ActorCore<M> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ActorCore<M> {
        &mut self.core
    }

    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    /// Compact log-probabilities of every sample in `data` under the current
    /// parameters.
    pub fn compute_log_prob(&mut self, data: &Batch) -> Result<Array2<f32>> {
        self.core.compute_log_prob(data)
    }

    /// Run `ppo_epochs` passes over `data`, one optimizer step per mini-batch,
    /// then advance the LR schedule.
    pub fn update_policy(&mut self, data: &Batch) -> Result<MetricsLog> {
        let temperature = data.temperature()?;
        let config = self.core.config().clone();

        let mut keys = FORWARD_KEYS.to_vec();
        keys.extend(["old_log_probs", "advantages"]);
        let with_reference = self.loss.uses_reference() && data.contains("ref_log_probs");
        if with_reference {
            keys.push("ref_log_probs");
        } else if self.loss.uses_reference() {
            debug!("No reference log-probs in batch, skipping the KL penalty");
        }
        let selected = data.select(&keys, &[MULTI_MODAL_KEY])?;
        let gradient_accumulation = config.gradient_accumulation() as f32;
        let progress = self.core.log_progress();

        let mut metrics = MetricsLog::new();
        for epoch in 0..config.ppo_epochs {
            let source = if config.shuffle_mini_batches {
                selected.shuffle(&mut self.rng)?
            } else {
                selected.clone()
            };
            let mini_batches = source.split(config.global_batch_size_per_device)?;
            for (mini_idx, mini_batch) in mini_batches.iter().enumerate() {
                if progress {
                    info!(
                        epoch,
                        mini_batch = mini_idx + 1,
                        total = mini_batches.len(),
                        "Training mini-batch"
                    );
                }
                let mini_start = Instant::now();
                let micro_batches = mini_batch.split(config.micro_batch_size_per_device_for_update)?;
                for (micro_idx, micro_batch) in micro_batches.iter().enumerate() {
                    let micro_start = Instant::now();
                    self.train_micro_batch(micro_batch, temperature, gradient_accumulation, &mut metrics)
                        .with_context(|| {
                            format!("Micro-batch {} of mini-batch {} failed", micro_idx + 1, mini_idx + 1)
                        })?;
                    if progress {
                        debug!(
                            micro_batch = micro_idx + 1,
                            total = micro_batches.len(),
                            secs = micro_start.elapsed().as_secs_f64(),
                            "Finished micro-batch"
                        );
                    }
                }

                let grad_norm = self.optimizer_step()?;
                metrics.append("actor/grad_norm", f64::from(grad_norm));
                if progress {
                    info!(
                        mini_batch = mini_idx + 1,
                        total = mini_batches.len(),
                        grad_norm,
                        secs = mini_start.elapsed().as_secs_f64(),
                        "Finished mini-batch"
                    );
                }
            }
        }

        metrics.append("actor/lr", f64::from(self.optimizer.lr()));
        self.scheduler.step();
        self.optimizer.set_lr(self.scheduler.get_lr());
        Ok(metrics)
    }

    fn train_micro_batch(
        &mut self,
        micro_batch: &Batch,
        temperature: f32,
        gradient_accumulation: f32,
        metrics: &mut MetricsLog,
    ) -> Result<()> {
        let (log_probs, tape) = self.core.forward_micro_batch(micro_batch, temperature, true)?;
        let tape = tape.context("forward pass did not keep a tape")?;
        let compact_response_mask = micro_batch.mask2("compact_response_mask")?;
        let ref_log_probs = if self.loss.uses_reference() && micro_batch.contains("ref_log_probs") {
            Some(micro_batch.float2("ref_log_probs")?)
        } else {
            None
        };
        let output = self.loss.compute(&PolicyLossInput {
            old_log_probs: micro_batch.float2("old_log_probs")?,
            log_probs: log_probs.view(),
            advantages: micro_batch.float2("advantages")?,
            response_mask: compact_response_mask.view(),
            ref_log_probs,
        })?;

        let grad = output.grad_log_probs.mapv(|g| g / gradient_accumulation);
        self.core.backward(tape, &grad)?;

        metrics.append_all([
            ("actor/pg_loss", f64::from(output.loss)),
            ("actor/pg_clipfrac_higher", f64::from(output.pg_clipfrac_higher)),
            ("actor/pg_clipfrac_lower", f64::from(output.pg_clipfrac_lower)),
            ("actor/entropy_loss", f64::from(output.entropy_loss)),
            ("actor/ppo_kl", f64::from(output.ppo_kl)),
        ]);
        if let (Some(kl_loss), Some(kl_coef)) = (output.kl_loss, self.loss.kl_coef()) {
            metrics.append("actor/kl_loss", f64::from(kl_loss));
            metrics.append("actor/kl_coef", f64::from(kl_coef));
        }
        Ok(())
    }

    /// Reduce and clip the accumulated gradients, then step unless the global
    /// norm is not finite. Gradients are cleared either way.
    fn optimizer_step(&mut self) -> Result<f32> {
        let max_norm = self.core.config().max_grad_norm;
        let model = self.core.model_mut();
        model.reduce_gradients()?;
        let grad_norm = model.clip_grad_norm(max_norm)?;

        if grad_norm.is_finite() {
            let (params, grads) = model.shard_mut();
            self.optimizer.step(params, grads)?;
            model.sync_module_params()?;
        } else {
            warn!(grad_norm, "Gradient norm is not finite, skipping update");
        }
        model.zero_grad();
        Ok(grad_norm)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint state
// ---------------------------------------------------------------------------

impl<M: CausalLm> Checkpointable for TrainablePolicy<M> {
    fn model_shard(&self) -> ModelShardState {
        model_shard_of(self.core.model())
    }

    fn load_model_shard(&mut self, state: ModelShardState) -> Result<()> {
        self.core.model_mut().load_local_params(state.values)
    }

    fn has_optimizer(&self) -> bool {
        true
    }

    fn optimizer_shard(&self) -> Option<OptimizerShardState> {
        let model = self.core.model();
        Some(OptimizerShardState {
            shard: model.shard(),
            offset: model.flat_range().start,
            total_numel: model.total_numel(),
            state: self.optimizer.state_dict(),
        })
    }

    fn load_optimizer_shard(&mut self, state: OptimizerShardState) -> Result<()> {
        self.optimizer.load_state_dict(state.state)?;
        Ok(())
    }

    fn extra_state(&self) -> Option<ExtraState> {
        Some(ExtraState {
            lr_scheduler: self.scheduler.state_dict(),
            rng: self.rng.snapshot(),
        })
    }

    fn load_extra_state(&mut self, state: &ExtraState) -> Result<()> {
        self.scheduler.load_state_dict(&state.lr_scheduler)?;
        self.rng.restore(&state.rng);
        Ok(())
    }

    fn consolidated_model(&self) -> Result<ConsolidatedModel, ExportError> {
        consolidate(self.core.model())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actor::forward::tests::{bigram, sample_batch};
    use crate::config::ActorConfig;
    use crate::data::count_true;
    use crate::distributed::{Communicator, LocalCommunicator, NoOpCommunicator, WorkerEnv};
    use crate::model::BigramLm;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    pub(crate) fn actor_config() -> ActorConfig {
        ActorConfig {
            global_batch_size_per_device: 2,
            micro_batch_size_per_device_for_update: 1,
            micro_batch_size_per_device_for_experience: 2,
            log_progress: false,
            ..ActorConfig::default()
        }
    }

    pub(crate) fn optim_config() -> OptimConfig {
        OptimConfig {
            lr: 5e-2,
            weight_decay: 0.0,
            ..OptimConfig::default()
        }
    }

    pub(crate) fn policy_on(
        comm: Arc<dyn Communicator>,
        config: ActorConfig,
        seed: u64,
    ) -> TrainablePolicy<BigramLm> {
        let model = BigramLm::new(bigram().config().clone(), seed);
        let worker = WorkerEnv {
            rank: comm.rank(),
            local_rank: comm.rank(),
            world_size: comm.world_size(),
        };
        let core = ActorCore::new(config, model, comm, Arc::new(NoOpCommunicator), worker).unwrap();
        TrainablePolicy::new(core, &optim_config())
    }

    pub(crate) fn policy(config: ActorConfig) -> TrainablePolicy<BigramLm> {
        policy_on(Arc::new(NoOpCommunicator), config, 7)
    }

    /// The sample batch with on-policy old log-probs and the given advantage
    /// on every scored token.
    pub(crate) fn training_batch(policy: &mut TrainablePolicy<BigramLm>, advantage: f32) -> Batch {
        let mut batch = sample_batch();
        let old = policy.compute_log_prob(&batch).unwrap();
        let advantages = Array2::from_elem(old.raw_dim(), advantage);
        batch.insert_tensor("old_log_probs", old).unwrap();
        batch.insert_tensor("advantages", advantages).unwrap();
        batch
    }

    fn full_params(policy: &TrainablePolicy<BigramLm>) -> Vec<f32> {
        policy
            .core()
            .model()
            .module()
            .parameters()
            .iter()
            .flat_map(|p| p.data.iter().copied())
            .collect()
    }

    #[test]
    fn test_update_records_metrics() {
        let mut policy = policy(actor_config());
        let batch = training_batch(&mut policy, 1.0);
        let metrics = policy.update_policy(&batch).unwrap();

        // 3 samples, mini-batch 2, micro-batch 1: 3 micro-batches, 2 steps.
        assert_eq!(metrics.get("actor/pg_loss").unwrap().len(), 3);
        assert_eq!(metrics.get("actor/grad_norm").unwrap().len(), 2);
        assert_eq!(metrics.get("actor/lr").unwrap(), &[5e-2f32 as f64]);
        for key in [
            "actor/pg_clipfrac_higher",
            "actor/pg_clipfrac_lower",
            "actor/entropy_loss",
            "actor/ppo_kl",
        ] {
            assert_eq!(metrics.get(key).unwrap().len(), 3, "{key}");
        }
        assert!(metrics.get("actor/kl_loss").is_none());
        // On-policy: ratio 1, nothing clipped.
        assert_abs_diff_eq!(metrics.get("actor/ppo_kl").unwrap()[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_positive_advantage_raises_log_probs() {
        // One step over the whole batch.
        let config = ActorConfig {
            global_batch_size_per_device: 3,
            micro_batch_size_per_device_for_update: 3,
            ..actor_config()
        };
        let mut policy = policy(config);
        let batch = training_batch(&mut policy, 1.0);
        let before = batch.float2("old_log_probs").unwrap().to_owned();
        policy.update_policy(&batch).unwrap();
        let after = policy.compute_log_prob(&batch).unwrap();

        let mask = batch.mask2("compact_response_mask").unwrap();
        let n = count_true(mask.view()) as f32;
        let mean = |lp: &Array2<f32>| {
            lp.iter().zip(mask.iter()).filter(|(_, &m)| m).map(|(v, _)| v).sum::<f32>() / n
        };
        assert!(mean(&after) > mean(&before));
    }

    #[test]
    fn test_kl_penalty_needs_reference_log_probs() {
        let config = ActorConfig {
            use_kl_loss: true,
            ..actor_config()
        };
        let mut with_kl = policy(config);
        let mut without_kl = policy(actor_config());
        let mut batch = training_batch(&mut with_kl, 1.0);

        // Without reference log-probs the update is the plain surrogate.
        let metrics = with_kl.update_policy(&batch).unwrap();
        let plain = without_kl.update_policy(&batch).unwrap();
        assert!(metrics.get("actor/kl_loss").is_none());
        assert!(metrics.get("actor/kl_coef").is_none());
        assert_eq!(metrics.get("actor/pg_loss"), plain.get("actor/pg_loss"));
        assert_eq!(full_params(&with_kl), full_params(&without_kl));

        let reference = batch.float2("old_log_probs").unwrap().to_owned();
        batch.insert_tensor("ref_log_probs", reference).unwrap();
        let metrics = with_kl.update_policy(&batch).unwrap();
        assert_eq!(metrics.get("actor/kl_loss").unwrap().len(), 3);
        assert_eq!(metrics.get("actor/kl_coef").unwrap()[0], f64::from(1e-2f32));
    }

    #[test]
    fn test_non_finite_gradient_skips_step() {
        let mut policy = policy(actor_config());
        let mut batch = training_batch(&mut policy, 1.0);
        let mut advantages = batch.float2("advantages").unwrap().to_owned();
        advantages[[0, 0]] = f32::NAN;
        batch.insert_tensor("advantages", advantages).unwrap();

        let before_local = policy.core().model().local_params().clone();
        let before_full = full_params(&policy);
        let metrics = policy.update_policy(&batch.index_select(&[0]).unwrap()).unwrap();

        assert!(metrics.get("actor/grad_norm").unwrap()[0].is_nan());
        let after_local = policy.core().model().local_params();
        assert!(before_local
            .iter()
            .zip(after_local.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits()));
        assert_eq!(before_full, full_params(&policy));
        assert!(policy.core().model().local_grads().iter().all(|&g| g == 0.0));
        for param in policy.core().model().module().parameters() {
            assert!(param.grad.iter().all(|&g| g == 0.0));
        }
    }

    #[test]
    fn test_scheduler_advances_after_update() {
        let optim = OptimConfig {
            lr_warmup_steps: 2,
            ..optim_config()
        };
        let core = ActorCore::new(
            actor_config(),
            bigram(),
            Arc::new(NoOpCommunicator),
            Arc::new(NoOpCommunicator),
            WorkerEnv::default(),
        )
        .unwrap();
        let mut policy = TrainablePolicy::new(core, &optim);
        assert_eq!(policy.lr(), 0.0);
        let batch = training_batch(&mut policy, 1.0);
        let metrics = policy.update_policy(&batch).unwrap();
        assert_eq!(metrics.get("actor/lr").unwrap(), &[0.0]);
        assert_abs_diff_eq!(policy.lr(), 2.5e-2, epsilon = 1e-9);
    }

    #[test]
    fn test_two_workers_match_single_worker() {
        let mut single = policy(actor_config());
        let batch = training_batch(&mut single, 0.5);
        single.update_policy(&batch).unwrap();
        let expected = full_params(&single);

        let group = LocalCommunicator::group(2);
        let results: Vec<Vec<f32>> = std::thread::scope(|scope| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    let comm = comm.clone();
                    let batch = batch.clone();
                    scope.spawn(move || {
                        let mut policy = policy_on(comm, actor_config(), 7);
                        policy.update_policy(&batch).unwrap();
                        full_params(&policy)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for params in results {
            for (a, b) in params.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-5);
            }
        }
    }
}
