use crate::{
    fewshot::PromptMode,
    metrics::MetricSample,
    request::{Request, Response},
    sample_log::SampleLog,
    traits::Task,
    Document,
};
use anyhow::Result;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("{task_name}/{prompt_mode} doc {doc_id}: {got} of {expected} responses recorded")]
    IncompleteBucket {
        task_name: String,
        prompt_mode: PromptMode,
        doc_id: usize,
        expected: usize,
        got: usize,
    },

    #[error("response for {task_name}/{prompt_mode} doc {doc_id} has no registered document")]
    UnregisteredDocument {
        task_name: String,
        prompt_mode: PromptMode,
        doc_id: usize,
    },

    #[error("no task named {0} to score results with")]
    UnknownTask(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub task_name: String,
    pub prompt_mode: PromptMode,
    pub doc_id: usize,
}

/// Where a flattened request came from.
#[derive(Debug, Clone, Copy)]
pub struct RequestOrigin<'a> {
    /// Position among the requests built for the document.
    pub sub_index: usize,
    pub task_name: &'a str,
    pub prompt_mode: PromptMode,
    pub document: &'a Document,
    pub doc_id: usize,
}

impl RequestOrigin<'_> {
    pub fn key(&self) -> BucketKey {
        BucketKey {
            task_name: self.task_name.to_owned(),
            prompt_mode: self.prompt_mode,
            doc_id: self.doc_id,
        }
    }
}

struct Entry<'a> {
    sub_index: usize,
    request: &'a Request,
    response: Response,
}

struct Bucket<'a> {
    document: &'a Document,
    expected: usize,
    entries: Vec<Entry<'a>>,
}

/// Metric samples of one (task, prompt mode), in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredSamples {
    pub metrics: IndexMap<String, Vec<MetricSample>>,
    pub num_docs: usize,
}

/// Collects responses per document and scores each document once all of them are in.
#[derive(Default)]
pub struct ResultRouter<'a> {
    buckets: IndexMap<BucketKey, Bucket<'a>>,
}

impl<'a> ResultRouter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a document and how many requests were built for it.
    pub fn register(&mut self, origin: &RequestOrigin<'a>, expected: usize) {
        self.buckets.insert(
            origin.key(),
            Bucket {
                document: origin.document,
                expected,
                entries: Vec::with_capacity(expected),
            },
        );
    }

    pub fn record(
        &mut self,
        origin: &RequestOrigin<'a>,
        request: &'a Request,
        response: Response,
    ) -> Result<(), RouterError> {
        let key = origin.key();
        let bucket = self
            .buckets
            .get_mut(&key)
            .ok_or_else(|| RouterError::UnregisteredDocument {
                task_name: key.task_name.clone(),
                prompt_mode: key.prompt_mode,
                doc_id: key.doc_id,
            })?;
        bucket.entries.push(Entry {
            sub_index: origin.sub_index,
            request,
            response,
        });
        Ok(())
    }

    /// True when every registered document has all of its responses.
    pub fn is_complete(&self) -> bool {
        self.buckets
            .values()
            .all(|bucket| bucket.entries.len() == bucket.expected)
    }

    /// Scores every document, consuming the buckets. Buckets are visited in registration order.
    pub fn route(
        self,
        lookup: impl Fn(&str) -> Option<&'a dyn Task>,
        sample_log: Option<&SampleLog>,
    ) -> Result<IndexMap<(String, PromptMode), ScoredSamples>> {
        if let Some((key, bucket)) = self
            .buckets
            .iter()
            .find(|(_, bucket)| bucket.entries.len() != bucket.expected)
        {
            return Err(RouterError::IncompleteBucket {
                task_name: key.task_name.clone(),
                prompt_mode: key.prompt_mode,
                doc_id: key.doc_id,
                expected: bucket.expected,
                got: bucket.entries.len(),
            }
            .into());
        }

        let mut scored: IndexMap<(String, PromptMode), ScoredSamples> = IndexMap::new();
        for (key, mut bucket) in self.buckets {
            let task = lookup(&key.task_name)
                .ok_or_else(|| RouterError::UnknownTask(key.task_name.clone()))?;
            bucket.entries.sort_by_key(|entry| entry.sub_index);
            let responses: Vec<Response> = bucket
                .entries
                .iter()
                .map(|entry| entry.response.clone())
                .collect();

            let metrics = task.process_results(bucket.document, &responses)?;

            if let Some(log) = sample_log {
                let generation = bucket
                    .entries
                    .iter()
                    .find(|entry| entry.request.kind().is_generation());
                if let Some(entry) = generation {
                    if let Some(prompt) = entry.request.args.prompt() {
                        if let Err(err) = log.append(
                            &key.task_name,
                            key.prompt_mode,
                            key.doc_id,
                            prompt,
                            &entry.response.to_string(),
                            &metrics,
                        ) {
                            warn!(
                                task = %key.task_name,
                                doc_id = key.doc_id,
                                error = %err,
                                "Could not write sample log"
                            );
                        }
                    }
                }
            }

            let group = scored
                .entry((key.task_name.clone(), key.prompt_mode))
                .or_default();
            group.num_docs += 1;
            for (metric, sample) in metrics {
                group.metrics.entry(metric).or_default().push(sample);
            }
        }

        for ((task_name, prompt_mode), group) in &scored {
            debug!(task = %task_name, %prompt_mode, docs = group.num_docs, "Scored documents");
        }
        Ok(scored)
    }
}
