use bm25::{Document, SearchEngine, SearchEngineBuilder};
use std::cmp::Ordering;

pub use bm25::Language;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// Position of the matching text in the corpus the index was built from.
    pub index: usize,
    pub score: f32,
}

/// Lexical BM25 index over a fixed corpus of texts.
pub struct Bm25Index {
    engine: SearchEngine<usize>,
    len: usize,
}

impl Bm25Index {
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_language(texts, Language::Portuguese)
    }

    pub fn with_language<I, S>(texts: I, language: Language) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let documents: Vec<Document<usize>> = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Document::new(i, text.into()))
            .collect();
        let len = documents.len();

        let engine = if documents.is_empty() {
            SearchEngineBuilder::<usize>::with_avgdl(1.0).build()
        } else {
            SearchEngineBuilder::<usize>::with_documents(language, documents).build()
        };

        tracing::debug!(documents = len, "Built BM25 index");
        Self { engine, len }
    }

    /// Top `k` hits with a positive score, best first. Equal scores keep corpus order.
    pub fn search(&self, query: &str, k: usize) -> Vec<SearchHit> {
        if self.is_empty() || k == 0 {
            return vec![];
        }
        let mut hits: Vec<SearchHit> = self
            .engine
            .search(query, self.len)
            .into_iter()
            .filter(|r| r.score > 0.0)
            .map(|r| SearchHit {
                index: r.document.id,
                score: r.score,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        hits.truncate(k);
        hits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
