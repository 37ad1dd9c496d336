use anyhow::Result;
use poeta_eval::{Backend, RequestArgs, RequestKind, Response};
use sha2::{Digest, Sha256};

/// Offline backend for smoke runs. Scores are a pure function of the request text, so two
/// runs over the same requests agree.
#[derive(Debug, Clone, Default)]
pub struct DummyBackend {
    generation: String,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text returned for every generation request.
    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = generation.into();
        self
    }

    fn score(parts: &[&str]) -> f64 {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        let bucket = u16::from_le_bytes([digest[0], digest[1]]) % 10_000;
        -(f64::from(bucket) / 1000.0) - 0.001
    }
}

impl Backend for DummyBackend {
    fn name(&self) -> &str {
        "dummy"
    }

    fn execute(&mut self, _kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
        Ok(batch
            .iter()
            .map(|args| match args {
                RequestArgs::Loglikelihood {
                    context,
                    continuation,
                } => {
                    let logprob = Self::score(&[&context.to_string(), continuation]);
                    Response::Loglikelihood {
                        logprob,
                        is_greedy: logprob > -1.0,
                    }
                }
                RequestArgs::GreedyUntil { .. } => Response::Text(self.generation.clone()),
                RequestArgs::LoglikelihoodRolling { text } => Response::Score(Self::score(&[text])),
            })
            .collect())
    }
}
