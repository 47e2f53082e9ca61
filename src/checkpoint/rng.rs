use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Exact position of a [`WorkerRng`], stored under `rng` in the extra state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub seed: [u8; 32],
    pub stream: u64,
    /// Word offset within the stream; a decimal string since JSON numbers
    /// cannot hold a u128.
    #[serde(with = "u128_string")]
    pub word_pos: u128,
}

mod u128_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// The worker's random generator, used for mini-batch shuffling.
///
/// Seeded from the configured seed with the worker rank as stream id, so each
/// worker draws an independent but reproducible sequence.
#[derive(Debug, Clone)]
pub struct WorkerRng {
    inner: ChaCha8Rng,
}

impl WorkerRng {
    pub fn new(seed: u64, rank: usize) -> Self {
        let mut inner = ChaCha8Rng::seed_from_u64(seed);
        inner.set_stream(rank as u64);
        Self { inner }
    }

    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot {
            seed: self.inner.get_seed(),
            stream: self.inner.get_stream(),
            word_pos: self.inner.get_word_pos(),
        }
    }

    pub fn restore(&mut self, snapshot: &RngSnapshot) {
        let mut inner = ChaCha8Rng::from_seed(snapshot.seed);
        inner.set_stream(snapshot.stream);
        inner.set_word_pos(snapshot.word_pos);
        self.inner = inner;
    }
}

impl RngCore for WorkerRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}
