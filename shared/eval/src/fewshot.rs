use crate::Document;
use anyhow::Result;
use poeta_core::{Bm25Index, SampleError, Sampler};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FewshotError {
    #[error("requested {requested} exemplars but only {available} eligible pool entries exist")]
    InsufficientPool { requested: usize, available: usize },

    #[error("requested {requested} manual exemplars but only {available} are eligible")]
    InsufficientManualExamples { requested: usize, available: usize },

    #[error("prompt mode dynamic-similar needs a similarity index, but the task has none")]
    MissingSimilarityIndex,

    #[error("similarity search failed: {0}")]
    SimilaritySearch(String),

    #[error("unsupported prompt mode {0}, expected one of: fixed, dynamic-random, dynamic-similar, manual")]
    UnsupportedPromptMode(String),
}

impl From<SampleError> for FewshotError {
    fn from(value: SampleError) -> Self {
        match value {
            SampleError::InsufficientPool {
                requested,
                available,
            } => FewshotError::InsufficientPool {
                requested,
                available,
            },
        }
    }
}

/// Exemplar selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptMode {
    Fixed,
    DynamicRandom,
    DynamicSimilar,
    Manual,
}

impl PromptMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PromptMode::Fixed => "fixed",
            PromptMode::DynamicRandom => "dynamic-random",
            PromptMode::DynamicSimilar => "dynamic-similar",
            PromptMode::Manual => "manual",
        }
    }
}

impl Display for PromptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PromptMode {
    type Err = FewshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fixed" => Ok(PromptMode::Fixed),
            "dynamic-random" => Ok(PromptMode::DynamicRandom),
            "dynamic-similar" => Ok(PromptMode::DynamicSimilar),
            "manual" => Ok(PromptMode::Manual),
            other => Err(FewshotError::UnsupportedPromptMode(other.to_owned())),
        }
    }
}

/// Ranks pool entries by similarity to a target document.
pub trait SimilarityIndex: Send + Sync {
    /// Positions in the exemplar pool of the best `k` matches, most similar first.
    fn search(&self, target: &Document, k: usize) -> Result<Vec<usize>>;
}

/// BM25 over the concatenation of a fixed set of document fields.
pub struct LexicalIndex {
    index: Bm25Index,
    fields: Vec<&'static str>,
}

impl LexicalIndex {
    pub fn build(pool: &[Document], fields: &[&'static str]) -> Result<Self> {
        let texts = pool
            .iter()
            .map(|doc| doc.joined_text(fields))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            index: Bm25Index::new(texts),
            fields: fields.to_vec(),
        })
    }
}

impl SimilarityIndex for LexicalIndex {
    fn search(&self, target: &Document, k: usize) -> Result<Vec<usize>> {
        let query = target.joined_text(&self.fields)?;
        Ok(self
            .index
            .search(&query, k)
            .into_iter()
            .map(|hit| hit.index)
            .collect())
    }
}

fn always_eligible(_: &Document) -> bool {
    true
}

/// Everything the selector needs from a task, already resolved for one target document.
pub struct ExemplarSource<'a, 'f> {
    pub pool: &'a [Document],
    pub manual: &'a [Document],
    pub similarity: Option<&'f dyn SimilarityIndex>,
    pub searcher_k: usize,
    /// Size of the pool prefix `fixed` draws from. `None` means a prefix of exactly `k`.
    pub fixed_prefix: Option<usize>,
    /// Task exclusion rule, e.g. "not from the same exam". The target itself is always excluded.
    pub is_eligible: &'f dyn Fn(&Document) -> bool,
}

impl<'a, 'f> ExemplarSource<'a, 'f> {
    pub fn new(pool: &'a [Document]) -> Self {
        Self {
            pool,
            manual: &[],
            similarity: None,
            searcher_k: 10,
            fixed_prefix: None,
            is_eligible: &always_eligible,
        }
    }

    fn eligible<'d>(&self, candidates: &'d [Document], target: &Document) -> Vec<&'d Document> {
        candidates
            .iter()
            .filter(|doc| *doc != target && (self.is_eligible)(*doc))
            .collect()
    }

    /// Exactly `k` exemplars for `target` under `mode`, in prompt order.
    pub fn select(
        &self,
        target: &Document,
        k: usize,
        mode: PromptMode,
        sampler: &mut Sampler,
    ) -> Result<Vec<&'a Document>, FewshotError> {
        if k == 0 {
            return Ok(vec![]);
        }
        match mode {
            PromptMode::Fixed => {
                let prefix = self.fixed_prefix.unwrap_or(k);
                let candidates: Vec<&Document> = self
                    .eligible(self.pool, target)
                    .into_iter()
                    .take(prefix)
                    .collect();
                Ok(sampler
                    .sample_without_replacement(&candidates, k)?
                    .into_iter()
                    .copied()
                    .collect())
            }
            PromptMode::DynamicRandom => {
                let candidates = self.eligible(self.pool, target);
                Ok(sampler
                    .sample_without_replacement(&candidates, k)?
                    .into_iter()
                    .copied()
                    .collect())
            }
            PromptMode::Manual => {
                let candidates = self.eligible(self.manual, target);
                if candidates.len() < k {
                    return Err(FewshotError::InsufficientManualExamples {
                        requested: k,
                        available: candidates.len(),
                    });
                }
                Ok(candidates.into_iter().take(k).collect())
            }
            PromptMode::DynamicSimilar => self.select_similar(target, k),
        }
    }

    fn select_similar(
        &self,
        target: &Document,
        k: usize,
    ) -> Result<Vec<&'a Document>, FewshotError> {
        let index = self.similarity.ok_or(FewshotError::MissingSimilarityIndex)?;
        let hits = index
            .search(target, self.searcher_k)
            .map_err(|err| FewshotError::SimilaritySearch(err.to_string()))?;

        let mut chosen: Vec<usize> = Vec::with_capacity(k);
        for hit in hits {
            if chosen.len() == k {
                break;
            }
            let Some(doc) = self.pool.get(hit) else {
                continue;
            };
            if *doc != *target && (self.is_eligible)(doc) && !chosen.contains(&hit) {
                chosen.push(hit);
            }
        }

        let found = chosen.len();
        for (position, doc) in self.pool.iter().enumerate() {
            if chosen.len() == k {
                break;
            }
            if *doc != *target && (self.is_eligible)(doc) && !chosen.contains(&position) {
                chosen.push(position);
            }
        }
        if chosen.len() < k {
            return Err(FewshotError::InsufficientPool {
                requested: k,
                available: chosen.len(),
            });
        }
        if found < k {
            tracing::debug!(found, padded = k - found, "Padded similar exemplars");
        }

        chosen.reverse();
        Ok(chosen.into_iter().map(|i| &self.pool[i]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn pool() -> Vec<Document> {
        ["A", "B", "C", "D", "E"]
            .iter()
            .map(|id| doc!({ "id": id, "text": format!("texto {id}") }))
            .collect()
    }

    fn ids(docs: &[&Document]) -> Vec<String> {
        docs.iter()
            .map(|d| d.get_str("id").unwrap().to_owned())
            .collect()
    }

    struct FixedHits(Vec<usize>);

    impl SimilarityIndex for FixedHits {
        fn search(&self, _target: &Document, k: usize) -> Result<Vec<usize>> {
            Ok(self.0.iter().copied().take(k).collect())
        }
    }

    #[test]
    fn prompt_mode_names() {
        for mode in [
            PromptMode::Fixed,
            PromptMode::DynamicRandom,
            PromptMode::DynamicSimilar,
            PromptMode::Manual,
        ] {
            assert_eq!(mode.as_str().parse::<PromptMode>().unwrap(), mode);
        }
        assert_eq!(
            "zero-shot".parse::<PromptMode>().unwrap_err(),
            FewshotError::UnsupportedPromptMode("zero-shot".into())
        );
    }

    #[test]
    fn fixed_defaults_to_prefix_of_k() {
        let pool = pool();
        let source = ExemplarSource::new(&pool);
        let target = doc!({ "id": "Z" });
        let mut picked = ids(&source
            .select(&target, 2, PromptMode::Fixed, &mut Sampler::new(5))
            .unwrap());
        picked.sort();
        assert_eq!(picked, vec!["A", "B"]);
    }

    #[rstest]
    fn dynamic_random_never_selects_target(#[values(0, 1, 2, 3, 4)] target: usize) {
        let pool = pool();
        let source = ExemplarSource::new(&pool);
        for seed in 0..20 {
            let picked = source
                .select(
                    &pool[target],
                    4,
                    PromptMode::DynamicRandom,
                    &mut Sampler::new(seed),
                )
                .unwrap();
            assert_eq!(picked.len(), 4);
            assert!(picked.iter().all(|d| **d != pool[target]));
        }
    }

    #[test]
    fn dynamic_random_fails_when_pool_too_small() {
        let pool = pool();
        let source = ExemplarSource::new(&pool);
        let err = source
            .select(&pool[0], 5, PromptMode::DynamicRandom, &mut Sampler::new(0))
            .unwrap_err();
        assert_eq!(
            err,
            FewshotError::InsufficientPool {
                requested: 5,
                available: 4
            }
        );
    }

    #[test]
    fn exclusion_predicate_applies_to_every_mode() {
        let pool = pool();
        let not_b = |d: &Document| d.get_str("id").ok() != Some("B");
        let hits = FixedHits(vec![1, 2]);
        let source = ExemplarSource {
            manual: &pool,
            similarity: Some(&hits),
            is_eligible: &not_b,
            ..ExemplarSource::new(&pool)
        };
        let target = doc!({ "id": "Z" });
        for mode in [
            PromptMode::Fixed,
            PromptMode::DynamicRandom,
            PromptMode::DynamicSimilar,
            PromptMode::Manual,
        ] {
            let picked = source
                .select(&target, 3, mode, &mut Sampler::new(9))
                .unwrap();
            assert_eq!(picked.len(), 3);
            assert!(!ids(&picked).contains(&"B".to_string()), "{mode}");
        }
    }

    #[test]
    fn manual_takes_first_k_skipping_target() {
        let pool = pool();
        let source = ExemplarSource {
            manual: &pool,
            ..ExemplarSource::new(&[])
        };
        let picked = source
            .select(&pool[0], 2, PromptMode::Manual, &mut Sampler::new(0))
            .unwrap();
        assert_eq!(ids(&picked), vec!["B", "C"]);
    }

    #[test]
    fn similar_without_index_fails() {
        let pool = pool();
        let source = ExemplarSource::new(&pool);
        let err = source
            .select(
                &doc!({}),
                1,
                PromptMode::DynamicSimilar,
                &mut Sampler::new(0),
            )
            .unwrap_err();
        assert_eq!(err, FewshotError::MissingSimilarityIndex);
    }

    #[test]
    fn similar_skips_target_hit() {
        let pool = pool();
        let hits = FixedHits(vec![2, 3, 4]);
        let source = ExemplarSource {
            similarity: Some(&hits),
            ..ExemplarSource::new(&pool)
        };
        let picked = source
            .select(
                &pool[2],
                2,
                PromptMode::DynamicSimilar,
                &mut Sampler::new(0),
            )
            .unwrap();
        assert_eq!(ids(&picked), vec!["E", "D"]);
    }

    #[test]
    fn lexical_index_ranks_pool() {
        let pool = vec![
            doc!({ "text": "o gato subiu no telhado" }),
            doc!({ "text": "a inflação caiu" }),
        ];
        let index = LexicalIndex::build(&pool, &["text"]).unwrap();
        let hits = index
            .search(&doc!({ "text": "inflação" }), 2)
            .unwrap();
        assert_eq!(hits.first(), Some(&1));
    }
}
