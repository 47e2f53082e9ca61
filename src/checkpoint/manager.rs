use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::export::{export_consolidated_model, ConsolidatedModel};
use super::format::{
    read_extra_state, read_model_shard, read_optim_shard, write_extra_state, write_model_shard,
    write_optim_shard, ExtraState, ModelShardState, OptimizerShardState,
};
use crate::config::CheckpointConfig;
use crate::distributed::{Communicator, ShardDescriptor};
use crate::error::ExportError;
use crate::model::ProcessingClass;

// ---------------------------------------------------------------------------
// Checkpoint targets
// ---------------------------------------------------------------------------

/// State a policy hands to and takes back from the checkpoint manager.
///
/// Implementations without an optimizer (a frozen reference policy) keep the
/// defaults and are always restored model-only.
pub trait Checkpointable {
    fn model_shard(&self) -> ModelShardState;

    /// Replace the owned parameter range. Collective.
    fn load_model_shard(&mut self, state: ModelShardState) -> Result<()>;

    fn has_optimizer(&self) -> bool {
        false
    }

    fn optimizer_shard(&self) -> Option<OptimizerShardState> {
        None
    }

    fn load_optimizer_shard(&mut self, _state: OptimizerShardState) -> Result<()> {
        bail!("this policy has no optimizer state")
    }

    fn extra_state(&self) -> Option<ExtraState> {
        None
    }

    fn load_extra_state(&mut self, _state: &ExtraState) -> Result<()> {
        bail!("this policy has no scheduler or rng state")
    }

    /// Full model assembled from every worker. Collective.
    fn consolidated_model(&self) -> Result<ConsolidatedModel, ExportError>;
}

/// What [`CheckpointManager::load_checkpoint`] restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No path given.
    Skipped,
    /// Parameters only; optimizer, scheduler and rng untouched.
    ModelOnly,
    /// Parameters, optimizer, scheduler and rng.
    Full,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Saves and restores one worker's shard files in a directory shared by the
/// whole group. Every method is collective: all workers call it with the same
/// path in the same order.
pub struct CheckpointManager {
    comm: Arc<dyn Communicator>,
    config: CheckpointConfig,
    processor: Option<Arc<dyn ProcessingClass>>,
    saved_paths: VecDeque<PathBuf>,
}

impl CheckpointManager {
    pub fn new(comm: Arc<dyn Communicator>, config: CheckpointConfig) -> Self {
        Self {
            comm,
            config,
            processor: None,
            saved_paths: VecDeque::new(),
        }
    }

    /// Processor whose artifacts are written next to the consolidated model.
    pub fn with_processor(mut self, processor: Arc<dyn ProcessingClass>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn shard(&self) -> ShardDescriptor {
        ShardDescriptor::of(self.comm.as_ref())
    }

    /// Paths saved by this manager that retention has not removed yet.
    pub fn saved_paths(&self) -> impl Iterator<Item = &Path> {
        self.saved_paths.iter().map(PathBuf::as_path)
    }

    /// Exchange a success flag so that a local failure is reported on every
    /// rank instead of leaving peers blocked in the next collective.
    fn agree<T>(&self, local: Result<T>, what: &str) -> Result<T> {
        let flag = if local.is_ok() { 1.0 } else { 0.0 };
        let flags = self
            .comm
            .all_gather(&[flag])
            .with_context(|| format!("Failed to exchange {what} status"))?;
        let local = local?;
        let failed: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, f)| f.first().copied() != Some(1.0))
            .map(|(rank, _)| rank)
            .collect();
        if !failed.is_empty() {
            bail!("{what} failed on rank(s) {failed:?}");
        }
        Ok(local)
    }

    fn prepare_dir(&self, path: &Path) -> Result<()> {
        let created = if self.comm.rank() == 0 {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create checkpoint directory {}", path.display()))
        } else {
            Ok(())
        };
        self.agree(created, "checkpoint directory creation")?;
        // Workers on other hosts may not see rank 0's directory.
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create checkpoint directory {}", path.display()))?;
        Ok(())
    }

    /// Write model, optimizer and extra state shards, then best-effort export
    /// the consolidated model.
    pub fn save_checkpoint<T: Checkpointable + ?Sized>(&mut self, path: &Path, target: &T) -> Result<()> {
        let shard = self.shard();
        self.prepare_dir(path)?;

        let written = Self::write_shards(path, shard, target);
        self.agree(written, "checkpoint shard write")?;
        debug!(rank = shard.rank, path = %path.display(), "Saved checkpoint shards");

        if self.config.export_merged_model {
            self.export_merged(path, target);
            self.comm.barrier().context("Barrier after consolidated export failed")?;
        }

        self.record_saved(path);
        info!(
            path = %path.display(),
            world_size = shard.world_size,
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Write the model shard only.
    pub fn save_model_only<T: Checkpointable + ?Sized>(&mut self, path: &Path, target: &T) -> Result<()> {
        let shard = self.shard();
        self.prepare_dir(path)?;
        let written = write_model_shard(&path.join(shard.model_file()), &target.model_shard());
        self.agree(written, "model shard write")?;
        info!(path = %path.display(), "Saved model shards");
        Ok(())
    }

    fn write_shards<T: Checkpointable + ?Sized>(path: &Path, shard: ShardDescriptor, target: &T) -> Result<()> {
        write_model_shard(&path.join(shard.model_file()), &target.model_shard())?;
        if let Some(optim) = target.optimizer_shard() {
            write_optim_shard(&path.join(shard.optim_file()), &optim)?;
        }
        if let Some(extra) = target.extra_state() {
            write_extra_state(&path.join(shard.extra_state_file()), &extra)?;
        }
        Ok(())
    }

    fn export_merged<T: Checkpointable + ?Sized>(&self, path: &Path, target: &T) {
        // Every worker takes part in the gather; rank 0 writes.
        let result = target.consolidated_model().and_then(|model| {
            if self.comm.rank() == 0 {
                export_consolidated_model(path, &model, self.processor.as_deref()).map(|_| ())
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            warn!(
                rank = self.comm.rank(),
                path = %path.display(),
                error = %err,
                "Consolidated model export failed; sharded checkpoint is unaffected"
            );
        }
    }

    fn record_saved(&mut self, path: &Path) {
        if !self.saved_paths.iter().any(|p| p == path) {
            self.saved_paths.push_back(path.to_path_buf());
        }
        let Some(keep) = self.config.max_ckpt_to_keep else {
            return;
        };
        while self.saved_paths.len() > keep.max(1) {
            let Some(oldest) = self.saved_paths.pop_front() else {
                break;
            };
            if self.comm.rank() != 0 {
                continue;
            }
            match std::fs::remove_dir_all(&oldest) {
                Ok(()) => info!(path = %oldest.display(), "Removed old checkpoint"),
                Err(err) => warn!(path = %oldest.display(), error = %err, "Failed to remove old checkpoint"),
            }
        }
    }

    /// Restore this worker's shards from `path`.
    ///
    /// Every shard is read and validated before anything is applied, and the
    /// outcome is agreed across the group: a missing or incompatible model
    /// shard on any rank fails the load on every rank. A missing optimizer
    /// shard on any rank degrades the whole group to a model-only restore.
    pub fn load_checkpoint<T: Checkpointable + ?Sized>(
        &mut self,
        path: Option<&Path>,
        target: &mut T,
    ) -> Result<LoadOutcome> {
        let Some(path) = path else {
            return Ok(LoadOutcome::Skipped);
        };
        let shard = self.shard();
        let local = self.read_shards(path, target);
        let full_here = matches!(&local, Ok(read) if read.optimizer.is_some());
        let ShardsRead { model, optimizer } = self.agree(local, "checkpoint shard read")?;

        let flags = self
            .comm
            .all_gather(&[if full_here { 1.0 } else { 0.0 }])
            .context("Failed to exchange optimizer shard status")?;
        let full_everywhere = flags.iter().all(|f| f.first().copied() == Some(1.0));

        target.load_model_shard(model)?;
        let Some((optim, extra)) = optimizer else {
            return Ok(LoadOutcome::ModelOnly);
        };
        if !full_everywhere {
            warn!(
                path = %path.display(),
                rank = shard.rank,
                "Optimizer shard missing on another rank; restored model parameters only"
            );
            return Ok(LoadOutcome::ModelOnly);
        }
        target.load_optimizer_shard(optim)?;
        target.load_extra_state(&extra)?;
        info!(path = %path.display(), rank = shard.rank, "Loaded checkpoint");
        Ok(LoadOutcome::Full)
    }

    /// Read and validate this worker's shard files without touching `target`.
    fn read_shards<T: Checkpointable + ?Sized>(&self, path: &Path, target: &T) -> Result<ShardsRead> {
        let shard = self.shard();
        let model_path = path.join(shard.model_file());
        if !model_path.is_file() {
            bail!("model shard {} not found", model_path.display());
        }

        let current = target.model_shard();
        let (header, model) = read_model_shard(&model_path)?;
        header
            .expect_topology(shard, current.offset, current.values.len(), current.total_numel)
            .with_context(|| format!("Incompatible model shard {}", model_path.display()))?;

        if !target.has_optimizer() {
            debug!(path = %path.display(), "Loading model shard for a policy without optimizer");
            return Ok(ShardsRead {
                model,
                optimizer: None,
            });
        }
        let optim_path = path.join(shard.optim_file());
        if !optim_path.is_file() {
            warn!(
                path = %path.display(),
                "No optimizer shard found; restoring model parameters only"
            );
            return Ok(ShardsRead {
                model,
                optimizer: None,
            });
        }

        let (header, optim) = read_optim_shard(&optim_path)?;
        header
            .expect_topology(shard, current.offset, current.values.len(), current.total_numel)
            .with_context(|| format!("Incompatible optimizer shard {}", optim_path.display()))?;
        let extra = read_extra_state(&path.join(shard.extra_state_file()))?;
        Ok(ShardsRead {
            model,
            optimizer: Some((optim, extra)),
        })
    }
}

/// Shards of one worker, read and validated but not yet applied.
struct ShardsRead {
    model: ModelShardState,
    optimizer: Option<(OptimizerShardState, ExtraState)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::trainable::tests::{actor_config, policy, policy_on, training_batch};
    use crate::actor::{ActorCore, ReferencePolicy};
    use crate::actor::forward::tests::bigram;
    use crate::checkpoint::MERGED_MODEL_DIR;
    use crate::config::ActorConfig;
    use crate::distributed::{LocalCommunicator, NoOpCommunicator, WorkerEnv};
    use crate::model::TokenizerFiles;

    fn manager(config: CheckpointConfig) -> CheckpointManager {
        CheckpointManager::new(Arc::new(NoOpCommunicator), config)
    }

    fn shuffling() -> ActorConfig {
        ActorConfig {
            shuffle_mini_batches: true,
            ..actor_config()
        }
    }

    #[test]
    fn test_round_trip_restores_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut saved = policy(shuffling());
        let batch = training_batch(&mut saved, 1.0);
        saved.update_policy(&batch).unwrap();

        let mut ckpt = manager(CheckpointConfig::default());
        ckpt.save_checkpoint(dir.path(), &saved).unwrap();
        for file in [
            "model_world_size_1_rank_0.pt",
            "optim_world_size_1_rank_0.pt",
            "extra_state_world_size_1_rank_0.pt",
        ] {
            assert!(dir.path().join(file).is_file(), "{file}");
        }
        assert!(dir.path().join(MERGED_MODEL_DIR).join("model.safetensors").is_file());
        assert!(dir.path().join(MERGED_MODEL_DIR).join("config.json").is_file());

        let mut restored = policy_on(Arc::new(NoOpCommunicator), shuffling(), 99);
        assert_ne!(restored.model_shard(), saved.model_shard());
        let outcome = ckpt.load_checkpoint(Some(dir.path()), &mut restored).unwrap();
        assert_eq!(outcome, LoadOutcome::Full);
        assert_eq!(restored.model_shard(), saved.model_shard());
        assert_eq!(restored.optimizer_shard(), saved.optimizer_shard());
        assert_eq!(restored.extra_state(), saved.extra_state());

        // Shuffled mini-batches draw from the restored rng, so both continue
        // identically.
        saved.update_policy(&batch).unwrap();
        restored.update_policy(&batch).unwrap();
        assert_eq!(restored.model_shard(), saved.model_shard());
        assert_eq!(restored.extra_state(), saved.extra_state());
    }

    #[test]
    fn test_missing_optimizer_shard_loads_model_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut saved = policy(actor_config());
        let batch = training_batch(&mut saved, 1.0);
        saved.update_policy(&batch).unwrap();
        let mut ckpt = manager(CheckpointConfig {
            export_merged_model: false,
            ..CheckpointConfig::default()
        });
        ckpt.save_checkpoint(dir.path(), &saved).unwrap();
        std::fs::remove_file(dir.path().join("optim_world_size_1_rank_0.pt")).unwrap();
        assert!(!dir.path().join(MERGED_MODEL_DIR).exists());

        let mut restored = policy_on(Arc::new(NoOpCommunicator), actor_config(), 99);
        let untouched_optim = restored.optimizer_shard();
        let untouched_extra = restored.extra_state();
        let outcome = ckpt.load_checkpoint(Some(dir.path()), &mut restored).unwrap();
        assert_eq!(outcome, LoadOutcome::ModelOnly);
        assert_eq!(restored.model_shard(), saved.model_shard());
        assert_eq!(restored.optimizer_shard(), untouched_optim);
        assert_eq!(restored.extra_state(), untouched_extra);
    }

    #[test]
    fn test_save_model_only_and_reference_restore() {
        let dir = tempfile::tempdir().unwrap();
        let saved = policy(actor_config());
        let mut ckpt = manager(CheckpointConfig::default());
        ckpt.save_model_only(dir.path(), &saved).unwrap();
        assert!(dir.path().join("model_world_size_1_rank_0.pt").is_file());
        assert!(!dir.path().join("optim_world_size_1_rank_0.pt").exists());
        assert!(!dir.path().join("extra_state_world_size_1_rank_0.pt").exists());

        let core = ActorCore::new(
            actor_config(),
            crate::model::BigramLm::new(bigram().config().clone(), 3),
            Arc::new(NoOpCommunicator),
            Arc::new(NoOpCommunicator),
            WorkerEnv::default(),
        )
        .unwrap();
        let mut reference = ReferencePolicy::new(core);
        let outcome = ckpt.load_checkpoint(Some(dir.path()), &mut reference).unwrap();
        assert_eq!(outcome, LoadOutcome::ModelOnly);
        assert_eq!(reference.model_shard(), saved.model_shard());
    }

    #[test]
    fn test_missing_model_shard_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = policy(actor_config());
        let mut ckpt = manager(CheckpointConfig::default());
        assert!(ckpt.load_checkpoint(Some(dir.path()), &mut target).is_err());
        assert_eq!(ckpt.load_checkpoint(None, &mut target).unwrap(), LoadOutcome::Skipped);
    }

    #[test]
    fn test_failed_export_does_not_fail_save() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-tokenizer.json");
        let processor = Arc::new(TokenizerFiles::new(vec![missing]));
        let mut ckpt = manager(CheckpointConfig::default()).with_processor(processor);
        let saved = policy(actor_config());
        let path = dir.path().join("step_1");
        ckpt.save_checkpoint(&path, &saved).unwrap();
        assert!(path.join("model_world_size_1_rank_0.pt").is_file());
        assert!(path.join("extra_state_world_size_1_rank_0.pt").is_file());
    }

    #[test]
    fn test_retention_removes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = manager(CheckpointConfig {
            export_merged_model: false,
            max_ckpt_to_keep: Some(1),
        });
        let saved = policy(actor_config());
        let first = dir.path().join("step_1");
        let second = dir.path().join("step_2");
        ckpt.save_checkpoint(&first, &saved).unwrap();
        ckpt.save_checkpoint(&second, &saved).unwrap();
        assert!(!first.exists());
        assert!(second.is_dir());
        assert_eq!(ckpt.saved_paths().collect::<Vec<_>>(), vec![second.as_path()]);
    }

    #[test]
    fn test_two_workers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let group = LocalCommunicator::group(2);
        std::thread::scope(|scope| {
            for comm in &group {
                let comm = comm.clone();
                let path = path.clone();
                scope.spawn(move || {
                    let mut saved = policy_on(comm.clone(), actor_config(), 7);
                    let batch = training_batch(&mut saved, 1.0);
                    saved.update_policy(&batch).unwrap();
                    let mut ckpt = CheckpointManager::new(comm.clone(), CheckpointConfig::default());
                    ckpt.save_checkpoint(&path, &saved).unwrap();

                    let mut restored = policy_on(comm, actor_config(), 11);
                    let outcome = ckpt.load_checkpoint(Some(&path), &mut restored).unwrap();
                    assert_eq!(outcome, LoadOutcome::Full);
                    assert_eq!(restored.model_shard(), saved.model_shard());
                    assert_eq!(restored.optimizer_shard(), saved.optimizer_shard());
                });
            }
        });
        for rank in 0..2 {
            assert!(path.join(format!("model_world_size_2_rank_{rank}.pt")).is_file());
        }
        assert!(path.join(MERGED_MODEL_DIR).join("model.safetensors").is_file());

        // A single worker cannot pick up a two-worker checkpoint.
        let mut single = policy(actor_config());
        assert!(manager(CheckpointConfig::default())
            .load_checkpoint(Some(&path), &mut single)
            .is_err());
    }

    #[test]
    fn test_unreadable_extra_state_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut saved = policy(actor_config());
        let batch = training_batch(&mut saved, 1.0);
        saved.update_policy(&batch).unwrap();
        let mut ckpt = manager(CheckpointConfig {
            export_merged_model: false,
            ..CheckpointConfig::default()
        });
        ckpt.save_checkpoint(dir.path(), &saved).unwrap();
        std::fs::remove_file(dir.path().join("extra_state_world_size_1_rank_0.pt")).unwrap();

        let mut restored = policy_on(Arc::new(NoOpCommunicator), actor_config(), 99);
        let before_model = restored.model_shard();
        let before_optim = restored.optimizer_shard();
        assert!(ckpt.load_checkpoint(Some(dir.path()), &mut restored).is_err());
        assert_eq!(restored.model_shard(), before_model);
        assert_eq!(restored.optimizer_shard(), before_optim);

        std::fs::write(dir.path().join("extra_state_world_size_1_rank_0.pt"), b"{not json").unwrap();
        assert!(ckpt.load_checkpoint(Some(dir.path()), &mut restored).is_err());
        assert_eq!(restored.model_shard(), before_model);
    }

    #[test]
    fn test_missing_shard_on_one_worker_fails_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let group = LocalCommunicator::group(2);
        let results: Vec<(usize, bool, String)> = std::thread::scope(|scope| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    let comm = comm.clone();
                    let path = path.clone();
                    scope.spawn(move || {
                        let saved = policy_on(comm.clone(), actor_config(), 7);
                        let mut ckpt = CheckpointManager::new(
                            comm.clone(),
                            CheckpointConfig {
                                export_merged_model: false,
                                ..CheckpointConfig::default()
                            },
                        );
                        ckpt.save_checkpoint(&path, &saved).unwrap();
                        if comm.rank() == 0 {
                            std::fs::remove_file(path.join("model_world_size_2_rank_1.pt")).unwrap();
                        }
                        comm.barrier().unwrap();

                        let mut restored = policy_on(comm.clone(), actor_config(), 11);
                        let before = restored.model_shard();
                        let result = ckpt.load_checkpoint(Some(&path), &mut restored);
                        (
                            comm.rank(),
                            restored.model_shard() == before,
                            format!("{:#}", result.unwrap_err()),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.len(), 2);
        for (rank, untouched, message) in results {
            assert!(untouched, "rank {rank} applied a partial checkpoint");
            if rank == 1 {
                assert!(message.contains("not found"), "{message}");
            } else {
                assert!(message.contains("rank(s) [1]"), "{message}");
            }
        }
    }
}
