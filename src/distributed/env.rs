use anyhow::{Context, Result};

/// Worker identity as exported by the process launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }
}

impl WorkerEnv {
    /// Read `RANK`, `LOCAL_RANK` and `WORLD_SIZE`. Unset variables fall back to
    /// a single-worker layout; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid {} value {:?}", key, raw)),
                None => Ok(default),
            }
        };
        let rank = read("RANK", 0)?;
        let local_rank = read("LOCAL_RANK", rank)?;
        let world_size = read("WORLD_SIZE", 1)?.max(1);
        Ok(Self {
            rank,
            local_rank,
            world_size,
        })
    }

    pub fn is_rank_zero(&self) -> bool {
        self.rank == 0
    }
}
