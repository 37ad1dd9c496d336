use crate::{
    metrics::{sample_stddev, Aggregation, MetricSample},
    router::ScoredSamples,
    traits::Task,
};
use anyhow::Result;
use indexmap::IndexMap;
use poeta_core::Sampler;
use rayon::prelude::*;
use tracing::{debug, info};

pub const DEFAULT_BOOTSTRAP_ITERS: usize = 100_000;
/// Iteration cap for aggregations where [`Aggregation::is_expensive`] holds.
pub const EXPENSIVE_BOOTSTRAP_ITERS: usize = 1000;
pub const DEFAULT_BOOTSTRAP_SEED: u64 = 1234;
const BOOTSTRAP_CHUNK: usize = 1000;

/// Bootstrap standard error of `aggregation` over `samples`.
///
/// Resamples are drawn in chunks of [`BOOTSTRAP_CHUNK`], each from its own stream of `seed`,
/// so the result does not depend on how chunks are scheduled across threads.
pub fn bootstrap_stderr(
    aggregation: Aggregation,
    samples: &[MetricSample],
    iters: usize,
    seed: u64,
) -> Result<f64> {
    if samples.is_empty() || iters == 0 {
        return Ok(0.0);
    }
    let chunks = iters.div_ceil(BOOTSTRAP_CHUNK);
    let n = samples.len();
    let stats: Vec<Vec<f64>> = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let mut sampler = Sampler::for_stream(seed, chunk as u64);
            let count = BOOTSTRAP_CHUNK.min(iters - chunk * BOOTSTRAP_CHUNK);
            let mut resample: Vec<&MetricSample> = Vec::with_capacity(n);
            (0..count)
                .map(|_| {
                    resample.clear();
                    resample.extend((0..n).map(|_| &samples[sampler.index(n)]));
                    aggregation.apply(&resample)
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<_>>()?;
    let stats: Vec<f64> = stats.into_iter().flatten().collect();
    Ok(sample_stddev(&stats))
}

/// Reduces per-document samples to one value per metric plus its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregator {
    pub bootstrap_iters: usize,
    pub seed: u64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            bootstrap_iters: DEFAULT_BOOTSTRAP_ITERS,
            seed: DEFAULT_BOOTSTRAP_SEED,
        }
    }
}

impl Aggregator {
    pub fn new(bootstrap_iters: usize, seed: u64) -> Self {
        Self {
            bootstrap_iters,
            seed,
        }
    }

    fn iters_for(&self, aggregation: Aggregation) -> usize {
        if aggregation.is_expensive() {
            self.bootstrap_iters.min(EXPENSIVE_BOOTSTRAP_ITERS)
        } else {
            self.bootstrap_iters
        }
    }

    /// `metric -> value` and `metric_stderr -> value`, in the order the task emitted metrics.
    /// Metrics the task has no aggregation for are skipped.
    pub fn aggregate(
        &self,
        task: &dyn Task,
        scored: &ScoredSamples,
    ) -> Result<IndexMap<String, f64>> {
        let aggregations = task.aggregation();
        let mut out = IndexMap::new();
        for (metric, samples) in &scored.metrics {
            let Some(&aggregation) = aggregations.get(metric) else {
                debug!(task = %task, %metric, "No aggregation, skipping");
                continue;
            };
            let refs: Vec<&MetricSample> = samples.iter().collect();
            out.insert(metric.clone(), aggregation.apply(&refs)?);

            let iters = self.iters_for(aggregation);
            if iters > 0 && task.stderr_enabled(metric) {
                info!(task = %task, %metric, iters, "Bootstrapping standard error");
                let stderr = bootstrap_stderr(aggregation, samples, iters, self.seed)?;
                out.insert(format!("{metric}_stderr"), stderr);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::Metrics,
        prompt::Prompt,
        request::{Request, Response},
        Document,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use std::fmt::Display;

    struct Scored;

    impl Display for Scored {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "scored")
        }
    }

    impl Task for Scored {
        fn has_training_docs(&self) -> bool {
            false
        }
        fn has_validation_docs(&self) -> bool {
            false
        }
        fn has_test_docs(&self) -> bool {
            false
        }
        fn doc_to_text(&self, _doc: &Document) -> Result<String> {
            Ok(String::new())
        }
        fn doc_to_target(&self, _doc: &Document) -> Result<String> {
            Ok(String::new())
        }
        fn construct_requests(&self, _doc: &Document, _ctx: &Prompt) -> Result<Vec<Request>> {
            Ok(vec![])
        }
        fn process_results(&self, _doc: &Document, _responses: &[Response]) -> Result<Metrics> {
            Ok(Metrics::new())
        }
        fn aggregation(&self) -> IndexMap<String, Aggregation> {
            IndexMap::from([
                ("acc".to_string(), Aggregation::Mean),
                ("f1".to_string(), Aggregation::MacroF1),
                ("count".to_string(), Aggregation::Sum),
            ])
        }
        fn higher_is_better(&self) -> IndexMap<String, bool> {
            IndexMap::from([("acc".to_string(), true), ("f1".to_string(), true)])
        }
        fn stderr_enabled(&self, metric: &str) -> bool {
            metric != "count"
        }
    }

    fn scored() -> ScoredSamples {
        let acc = [1.0, 0.0, 1.0, 1.0, 0.0, 1.0].map(MetricSample::Scalar).to_vec();
        let f1 = ["a", "b", "a", "a", "b", "b"]
            .iter()
            .zip(["a", "a", "a", "b", "b", "b"])
            .map(|(p, g)| MetricSample::pair(*p, g))
            .collect();
        let count = vec![MetricSample::Scalar(1.0); 6];
        let debug = vec![MetricSample::Info("x".into()); 6];
        ScoredSamples {
            metrics: IndexMap::from([
                ("acc".to_string(), acc),
                ("f1".to_string(), f1),
                ("count".to_string(), count),
                ("debug_info".to_string(), debug),
            ]),
            num_docs: 6,
        }
    }

    #[test]
    fn aggregates_known_metrics_and_skips_the_rest() {
        let out = Aggregator::new(200, 1).aggregate(&Scored, &scored()).unwrap();
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["acc", "acc_stderr", "f1", "f1_stderr", "count"]);
        assert_relative_eq!(out["acc"], 4.0 / 6.0);
        assert_relative_eq!(out["count"], 6.0);
        assert!(out["acc_stderr"] > 0.0);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let aggregator = Aggregator::new(2500, 77);
        let first = aggregator.aggregate(&Scored, &scored()).unwrap();
        let second = aggregator.aggregate(&Scored, &scored()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stderr_tracks_analytic_value() {
        // Bernoulli(0.5) over 400 docs: stderr of the mean is about 0.5 / sqrt(400).
        let samples: Vec<MetricSample> = (0..400)
            .map(|i| MetricSample::Scalar((i % 2) as f64))
            .collect();
        let stderr = bootstrap_stderr(Aggregation::Mean, &samples, 3000, 5).unwrap();
        assert_relative_eq!(stderr, 0.025, epsilon = 0.004);
    }

    #[test]
    fn expensive_aggregations_are_capped() {
        let aggregator = Aggregator::new(DEFAULT_BOOTSTRAP_ITERS, 0);
        assert_eq!(aggregator.iters_for(Aggregation::Pearson), EXPENSIVE_BOOTSTRAP_ITERS);
        assert_eq!(aggregator.iters_for(Aggregation::Mean), DEFAULT_BOOTSTRAP_ITERS);
        assert_eq!(Aggregator::new(10, 0).iters_for(Aggregation::MacroF1), 10);
    }

    #[test]
    fn zero_iters_disables_stderr() {
        let out = Aggregator::new(0, 0).aggregate(&Scored, &scored()).unwrap();
        assert!(!out.contains_key("acc_stderr"));
    }
}
