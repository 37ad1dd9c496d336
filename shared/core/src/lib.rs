mod sampler;
mod similarity;

pub use sampler::{SampleError, Sampler, DOCUMENT_SHUFFLE_SEED};
pub use similarity::{Bm25Index, Language, SearchHit};
