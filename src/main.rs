//! rlhf-actor: run and inspect the sharded policy-gradient actor.
//!
//! - `update`   -- Run synthetic PPO updates across in-process workers
//! - `inspect`  -- Summarise a checkpoint directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use rlhf_actor::actor::{ActorCore, TrainablePolicy};
use rlhf_actor::checkpoint::format::{read_extra_state, read_model_shard, read_optim_shard};
use rlhf_actor::checkpoint::{CheckpointManager, MERGED_MODEL_DIR};
use rlhf_actor::config::TrainerConfig;
use rlhf_actor::data::{compact_mask_from_response, Batch, MetricsLog};
use rlhf_actor::distributed::{Communicator, LocalCommunicator, NoOpCommunicator, WorkerEnv};
use rlhf_actor::logging::init_tracing;
use rlhf_actor::model::{BigramConfig, BigramLm};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Sharded policy-gradient actor with padding-free packing.
#[derive(Parser)]
#[command(name = "rlhf-actor", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run synthetic PPO updates with the bigram reference model.
    Update {
        /// Number of in-process workers.
        #[arg(long, default_value_t = 2)]
        workers: usize,

        /// Number of `update_policy` calls.
        #[arg(long, default_value_t = 3)]
        steps: usize,

        /// Samples per worker per step.
        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        /// Padded sequence length.
        #[arg(long, default_value_t = 16)]
        seq_len: usize,

        /// Save a checkpoint here after the last step.
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Resume from this checkpoint directory first.
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Summarise the shard files and merged model of a checkpoint directory.
    Inspect {
        /// Checkpoint directory.
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrainerConfig::from_file(path)?,
        None => TrainerConfig::default(),
    };
    let _guard = init_tracing(&config.logging)?;

    match cli.command {
        Commands::Update {
            workers,
            steps,
            batch_size,
            seq_len,
            save_dir,
            resume,
        } => cmd_update(
            &config,
            &UpdateArgs {
                workers,
                steps,
                batch_size,
                seq_len,
                save_dir,
                resume,
            },
        ),
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// update
// ---------------------------------------------------------------------------

struct UpdateArgs {
    workers: usize,
    steps: usize,
    batch_size: usize,
    seq_len: usize,
    save_dir: Option<PathBuf>,
    resume: Option<PathBuf>,
}

fn cmd_update(config: &TrainerConfig, args: &UpdateArgs) -> Result<()> {
    if args.workers == 0 {
        bail!("--workers must be positive");
    }
    if args.seq_len < 3 {
        bail!("--seq-len must be at least 3");
    }
    let sp = config.actor.ulysses_size;
    if sp != 1 && sp != args.workers {
        bail!(
            "ulysses_size {} must be 1 or equal to --workers {} in the in-process demo",
            sp,
            args.workers
        );
    }
    tracing::info!(workers = args.workers, steps = args.steps, "Starting synthetic update");

    let group = LocalCommunicator::group(args.workers);
    let results: Vec<Result<MetricsLog>> = std::thread::scope(|scope| {
        let handles: Vec<_> = group
            .iter()
            .map(|comm| {
                let comm = comm.clone();
                scope.spawn(move || {
                    let result = run_worker(config, args, comm.clone());
                    if result.is_err() {
                        // Release peers blocked in a collective.
                        comm.abort();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("worker thread panicked"))))
            .collect()
    });

    let mut rank_zero = None;
    for (rank, result) in results.into_iter().enumerate() {
        let metrics = result.with_context(|| format!("Worker {} failed", rank))?;
        if rank == 0 {
            rank_zero = Some(metrics);
        }
    }
    if let Some(metrics) = rank_zero {
        println!("Metrics (rank 0, mean over all steps):");
        for (key, value) in metrics.summary() {
            println!("  {key}: {value:.6}");
        }
    }
    Ok(())
}

fn run_worker(config: &TrainerConfig, args: &UpdateArgs, comm: Arc<dyn Communicator>) -> Result<MetricsLog> {
    let worker = WorkerEnv {
        rank: comm.rank(),
        local_rank: comm.rank(),
        world_size: comm.world_size(),
    };
    let sp_group: Arc<dyn Communicator> = if config.actor.ulysses_size > 1 {
        comm.clone()
    } else {
        Arc::new(NoOpCommunicator)
    };
    let model_config = BigramConfig {
        max_position_embeddings: args.seq_len,
        ..BigramConfig::default()
    };
    let model = BigramLm::new(model_config.clone(), config.optim.seed);
    let core = ActorCore::new(config.actor.clone(), model, comm.clone(), sp_group, worker)?;
    let mut policy = TrainablePolicy::new(core, &config.optim);
    let mut checkpoints = CheckpointManager::new(comm, config.checkpoint.clone());

    if let Some(resume) = &args.resume {
        let outcome = checkpoints.load_checkpoint(Some(resume), &mut policy)?;
        tracing::info!(rank = worker.rank, ?outcome, "Resumed");
    }

    // With sequence parallelism every worker of the group must see the same
    // samples; otherwise each data-parallel worker draws its own.
    let data_seed = if config.actor.ulysses_size > 1 {
        config.optim.seed
    } else {
        config.optim.seed.wrapping_add(worker.rank as u64 + 1)
    };
    let mut rng = ChaCha8Rng::seed_from_u64(data_seed);

    let mut metrics = MetricsLog::new();
    for step in 0..args.steps {
        let mut batch = synthetic_batch(&mut rng, args.batch_size, args.seq_len, model_config.vocab_size)?;
        let old_log_probs = policy.compute_log_prob(&batch)?;
        let advantages = old_log_probs.mapv(|_| rng.gen_range(-1.0f32..1.0));
        batch.insert_tensor("old_log_probs", old_log_probs)?;
        batch.insert_tensor("advantages", advantages)?;

        let step_metrics = policy.update_policy(&batch)?;
        if worker.is_rank_zero() {
            tracing::info!(
                step,
                pg_loss = step_metrics.mean("actor/pg_loss").unwrap_or(f64::NAN),
                grad_norm = step_metrics.mean("actor/grad_norm").unwrap_or(f64::NAN),
                "Step finished"
            );
        }
        metrics.extend(step_metrics);
    }

    if let Some(dir) = &args.save_dir {
        checkpoints.save_checkpoint(dir, &policy)?;
    }
    Ok(metrics)
}

/// Right-padded prompt + response samples with random token ids.
fn synthetic_batch(rng: &mut ChaCha8Rng, batch_size: usize, seq_len: usize, vocab: usize) -> Result<Batch> {
    let mut input_ids = Array2::<i64>::zeros((batch_size, seq_len));
    let mut attention_mask = Array2::from_elem((batch_size, seq_len), false);
    let mut position_ids = Array2::<i64>::zeros((batch_size, seq_len));
    let mut response_mask = Array2::from_elem((batch_size, seq_len), false);

    for b in 0..batch_size {
        let prompt_len = rng.gen_range(1..=seq_len / 2);
        let response_len = rng.gen_range(1..=seq_len - prompt_len);
        let valid = prompt_len + response_len;
        for t in 0..valid {
            input_ids[[b, t]] = rng.gen_range(0..vocab as i64);
            attention_mask[[b, t]] = true;
            position_ids[[b, t]] = t as i64;
        }
        // Position t scores token t + 1, so the response is scored from the
        // last prompt token up to the second-to-last response token.
        for t in prompt_len - 1..valid - 1 {
            response_mask[[b, t]] = true;
        }
    }
    let compact = compact_mask_from_response(response_mask.view());
    let mut batch = Batch::new()
        .with_tensor("input_ids", input_ids)?
        .with_tensor("attention_mask", attention_mask)?
        .with_tensor("position_ids", position_ids)?
        .with_tensor("response_mask", response_mask)?
        .with_tensor("compact_response_mask", compact)?;
    batch.set_meta("temperature", 1.0);
    Ok(batch)
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &Path) -> Result<()> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "pt"))
        .collect();
    files.sort();

    println!("Checkpoint: {}", path.display());
    for file in &files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with("model_") {
            let (header, state) = read_model_shard(file)?;
            println!(
                "  {name}: rank {}/{} params [{}, {}) of {}{}",
                header.shard.rank,
                header.shard.world_size,
                state.offset,
                state.offset + state.values.len(),
                state.total_numel,
                header.saved_at.map(|t| format!(", saved {t}")).unwrap_or_default()
            );
        } else if name.starts_with("optim_") {
            let (_, state) = read_optim_shard(file)?;
            let buffers: Vec<&str> = state.state.buffers.keys().map(String::as_str).collect();
            println!(
                "  {name}: step {} lr {:.3e} buffers {:?}",
                state.state.step, state.state.lr, buffers
            );
        } else if name.starts_with("extra_state_") {
            let extra = read_extra_state(file)?;
            println!(
                "  {name}: scheduler {:?} step {} lr {:.3e}, rng stream {}",
                extra.lr_scheduler.schedule,
                extra.lr_scheduler.current_step,
                extra.lr_scheduler.last_lr,
                extra.rng.stream
            );
        } else {
            println!("  {name}: unrecognised");
        }
    }

    let merged = path.join(MERGED_MODEL_DIR);
    if merged.is_dir() {
        let mut entries: Vec<String> = std::fs::read_dir(&merged)
            .with_context(|| format!("Failed to read {}", merged.display()))?
            .filter_map(|entry| entry.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        println!("  {}/: {}", MERGED_MODEL_DIR, entries.join(", "));
    } else {
        println!("  {}/: not present", MERGED_MODEL_DIR);
    }
    Ok(())
}
