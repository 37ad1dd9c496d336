mod cache;
mod dummy;
mod error;
mod openai;
mod registry;

pub use cache::{cache_dir, CachingBackend, DEFAULT_CACHE_ROOT};
pub use dummy::DummyBackend;
pub use error::BackendError;
pub use openai::{OpenAiBackend, OpenAiConfig, Provider, PROVIDERS};
pub use registry::{get_backend, parse_model_args, ModelArgs, DUMMY};
