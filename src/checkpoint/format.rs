//! On-disk encoding of one worker's checkpoint files.
//!
//! Model and optimizer shards are safetensors files (little-endian f32) whose
//! header metadata records the shard topology; extra state is JSON.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::Array1;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};

use crate::distributed::ShardDescriptor;
use crate::optim::{OptimizerState, SchedulerState};

use super::rng::RngSnapshot;

const MODEL_TENSOR: &str = "flat_param";
const MODEL_FORMAT: &str = "rlhf-actor/model-shard";
const OPTIM_FORMAT: &str = "rlhf-actor/optim-shard";

// ---------------------------------------------------------------------------
// Shard records
// ---------------------------------------------------------------------------

/// The flat parameter range owned by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelShardState {
    pub shard: ShardDescriptor,
    pub offset: usize,
    pub total_numel: usize,
    pub values: Array1<f32>,
}

/// Optimizer internals for one worker's flat range.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerShardState {
    pub shard: ShardDescriptor,
    pub offset: usize,
    pub total_numel: usize,
    pub state: OptimizerState,
}

/// Scheduler position and RNG snapshot saved next to the shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraState {
    pub lr_scheduler: SchedulerState,
    pub rng: RngSnapshot,
}

/// Topology fields common to both shard kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardHeader {
    pub format: String,
    pub shard: ShardDescriptor,
    pub offset: usize,
    pub numel: usize,
    pub total_numel: usize,
    pub saved_at: Option<String>,
}

impl ShardHeader {
    fn to_metadata(&self) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        meta.insert("format".into(), self.format.clone());
        meta.insert("world_size".into(), self.shard.world_size.to_string());
        meta.insert("rank".into(), self.shard.rank.to_string());
        meta.insert("offset".into(), self.offset.to_string());
        meta.insert("numel".into(), self.numel.to_string());
        meta.insert("total_numel".into(), self.total_numel.to_string());
        meta.insert("saved_at".into(), chrono::Utc::now().to_rfc3339());
        meta
    }

    fn from_metadata(meta: &HashMap<String, String>) -> Result<Self> {
        let field = |key: &str| -> Result<usize> {
            meta.get(key)
                .with_context(|| format!("shard metadata is missing `{}`", key))?
                .parse::<usize>()
                .with_context(|| format!("shard metadata `{}` is not an integer", key))
        };
        Ok(Self {
            format: meta.get("format").cloned().unwrap_or_default(),
            shard: ShardDescriptor::new(field("rank")?, field("world_size")?)?,
            offset: field("offset")?,
            numel: field("numel")?,
            total_numel: field("total_numel")?,
            saved_at: meta.get("saved_at").cloned(),
        })
    }

    /// Fail unless this header describes the same slot of the same topology.
    pub fn expect_topology(&self, shard: ShardDescriptor, offset: usize, numel: usize, total_numel: usize) -> Result<()> {
        if self.shard != shard {
            bail!(
                "checkpoint shard is rank {} of {}, this worker is rank {} of {}",
                self.shard.rank,
                self.shard.world_size,
                shard.rank,
                shard.world_size
            );
        }
        if (self.offset, self.numel, self.total_numel) != (offset, numel, total_numel) {
            bail!(
                "checkpoint shard covers [{}, {}) of {}, this worker owns [{}, {}) of {}",
                self.offset,
                self.offset + self.numel,
                self.total_numel,
                offset,
                offset + numel,
                total_numel
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// safetensors helpers
// ---------------------------------------------------------------------------

fn to_le_bytes(values: &Array1<f32>) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_le_bytes(bytes: &[u8]) -> Array1<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize named f32 tensors with header metadata.
pub fn encode_tensors(
    tensors: &[(String, Vec<usize>, Vec<u8>)],
    metadata: HashMap<String, String>,
) -> Result<Vec<u8>> {
    let views = tensors
        .iter()
        .map(|(name, shape, bytes)| Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>, safetensors::SafeTensorError>>()
        .context("Failed to build tensor views")?;
    safetensors::serialize(views, &Some(metadata)).context("Failed to serialize tensors")
}

/// Named flat f32 tensors of a safetensors buffer plus its header metadata.
fn decode_tensors(bytes: &[u8]) -> Result<(HashMap<String, String>, BTreeMap<String, Array1<f32>>)> {
    let (_, header) = SafeTensors::read_metadata(bytes).context("Failed to read safetensors header")?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = SafeTensors::deserialize(bytes).context("Failed to parse safetensors data")?;
    let mut out = BTreeMap::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            bail!("tensor `{}` has dtype {:?}, expected F32", name, view.dtype());
        }
        out.insert(name, from_le_bytes(view.data()));
    }
    Ok((metadata, out))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

// ---------------------------------------------------------------------------
// Model shard
// ---------------------------------------------------------------------------

pub fn write_model_shard(path: &Path, state: &ModelShardState) -> Result<()> {
    let header = ShardHeader {
        format: MODEL_FORMAT.into(),
        shard: state.shard,
        offset: state.offset,
        numel: state.values.len(),
        total_numel: state.total_numel,
        saved_at: None,
    };
    let tensors = vec![(
        MODEL_TENSOR.to_string(),
        vec![state.values.len()],
        to_le_bytes(&state.values),
    )];
    let bytes = encode_tensors(&tensors, header.to_metadata())?;
    write_file(path, &bytes)
}

pub fn read_model_shard(path: &Path) -> Result<(ShardHeader, ModelShardState)> {
    let bytes = read_file(path)?;
    let (metadata, mut tensors) =
        decode_tensors(&bytes).with_context(|| format!("Invalid model shard {}", path.display()))?;
    let header = ShardHeader::from_metadata(&metadata)?;
    if header.format != MODEL_FORMAT {
        bail!("{} is not a model shard (format `{}`)", path.display(), header.format);
    }
    let values = tensors
        .remove(MODEL_TENSOR)
        .with_context(|| format!("{} has no `{}` tensor", path.display(), MODEL_TENSOR))?;
    if values.len() != header.numel {
        bail!(
            "{} declares {} elements but stores {}",
            path.display(),
            header.numel,
            values.len()
        );
    }
    let state = ModelShardState {
        shard: header.shard,
        offset: header.offset,
        total_numel: header.total_numel,
        values,
    };
    Ok((header, state))
}

// ---------------------------------------------------------------------------
// Optimizer shard
// ---------------------------------------------------------------------------

pub fn write_optim_shard(path: &Path, state: &OptimizerShardState) -> Result<()> {
    let numel = state
        .state
        .buffers
        .values()
        .next()
        .map(|b| b.len())
        .unwrap_or(0);
    let header = ShardHeader {
        format: OPTIM_FORMAT.into(),
        shard: state.shard,
        offset: state.offset,
        numel,
        total_numel: state.total_numel,
        saved_at: None,
    };
    let mut metadata = header.to_metadata();
    metadata.insert("step".into(), state.state.step.to_string());
    metadata.insert("lr".into(), state.state.lr.to_string());
    let tensors: Vec<_> = state
        .state
        .buffers
        .iter()
        .map(|(name, buffer)| (name.clone(), vec![buffer.len()], to_le_bytes(buffer)))
        .collect();
    let bytes = encode_tensors(&tensors, metadata)?;
    write_file(path, &bytes)
}

pub fn read_optim_shard(path: &Path) -> Result<(ShardHeader, OptimizerShardState)> {
    let bytes = read_file(path)?;
    let (metadata, buffers) =
        decode_tensors(&bytes).with_context(|| format!("Invalid optimizer shard {}", path.display()))?;
    let header = ShardHeader::from_metadata(&metadata)?;
    if header.format != OPTIM_FORMAT {
        bail!("{} is not an optimizer shard (format `{}`)", path.display(), header.format);
    }
    let step = metadata
        .get("step")
        .context("optimizer metadata is missing `step`")?
        .parse::<u64>()
        .context("optimizer metadata `step` is not an integer")?;
    let lr = metadata
        .get("lr")
        .context("optimizer metadata is missing `lr`")?
        .parse::<f32>()
        .context("optimizer metadata `lr` is not a number")?;
    let state = OptimizerShardState {
        shard: header.shard,
        offset: header.offset,
        total_numel: header.total_numel,
        state: OptimizerState { step, lr, buffers },
    };
    Ok((header, state))
}

// ---------------------------------------------------------------------------
// Extra state
// ---------------------------------------------------------------------------

pub fn write_extra_state(path: &Path, state: &ExtraState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state).context("Failed to serialize extra state")?;
    write_file(path, &json)
}

pub fn read_extra_state(path: &Path) -> Result<ExtraState> {
    let bytes = read_file(path)?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid extra state {}", path.display()))
}
