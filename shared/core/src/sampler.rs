use rand::{
    seq::{index, SliceRandom},
    Rng, SeedableRng,
};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

/// Seed used to shuffle every task's documents before slicing by `limit`.
/// Constant so document order never depends on the caller's fewshot seed.
pub const DOCUMENT_SHUFFLE_SEED: u64 = 42;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("cannot sample {requested} items without replacement from a pool of {available}")]
    InsufficientPool { requested: usize, available: usize },
}

/// A seeded, value-owned random stream.
///
/// Every call site that needs randomness builds its own `Sampler` from an explicit
/// seed (and optionally a stream id), so two call sites never share state.
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: ChaCha8Rng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..32].copy_from_slice(&seed.to_be_bytes());
        Self {
            rng: ChaCha8Rng::from_seed(bytes),
        }
    }

    /// An independent stream for the same seed, e.g. one per document or per bootstrap chunk.
    pub fn for_stream(seed: u64, stream: u64) -> Self {
        let mut sampler = Self::new(seed);
        sampler.rng.set_stream(stream);
        sampler
    }

    /// The sampler used for document ordering.
    pub fn document_order() -> Self {
        Self::new(DOCUMENT_SHUFFLE_SEED)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Shuffled copy, leaving `items` untouched.
    pub fn shuffled<T: Clone>(&mut self, items: &[T]) -> Vec<T> {
        let mut copy = items.to_vec();
        self.shuffle(&mut copy);
        copy
    }

    pub fn sample_indices(&mut self, len: usize, k: usize) -> Result<Vec<usize>, SampleError> {
        if k > len {
            return Err(SampleError::InsufficientPool {
                requested: k,
                available: len,
            });
        }
        Ok(index::sample(&mut self.rng, len, k).into_vec())
    }

    /// `k` distinct items in sampled order.
    pub fn sample_without_replacement<'a, T>(
        &mut self,
        items: &'a [T],
        k: usize,
    ) -> Result<Vec<&'a T>, SampleError> {
        Ok(self
            .sample_indices(items.len(), k)?
            .into_iter()
            .map(|i| &items[i])
            .collect())
    }

    /// Uniform index in `0..upper`. `upper` must be non-zero.
    pub fn index(&mut self, upper: usize) -> usize {
        self.rng.random_range(0..upper)
    }
}
