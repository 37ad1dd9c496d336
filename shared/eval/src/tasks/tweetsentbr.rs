/**
       TweetSentBR: Brazilian Portuguese tweets about TV shows, labeled negative,
       neutral or positive.

       Raw files carry the annotators' label in -1..=1 (or `-` when undecided); documents
       are stored with the label shifted to 0..=2. The corpus has no validation split, the
       test split serves both.
*/
use super::{argmax, dataset_splits, generated_text, squeeze_whitespace, Scoring};
use crate::{
    dataset::{Dataset, Split},
    fewshot::SimilarityIndex,
    metrics::{Aggregation, MetricSample, Metrics},
    prompt::Prompt,
    request::{Request, Response},
    traits::Task,
    Document,
};
use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde_json::Value;
use std::{fmt::Display, path::Path};

const KEYS_TO_INDEX: [&str; 1] = ["text"];
const SEARCHER_K: usize = 600;
const LABELS: [&str; 3] = [" negativa", " neutra", " positiva"];

fn prepare(_split: Split, mut doc: Document) -> Result<Option<Document>> {
    let Some(Value::String(text)) = doc.get("text") else {
        return Ok(None);
    };
    let text = squeeze_whitespace(text);
    if matches!(doc.get("sentiment"), Some(Value::String(s)) if s.trim() == "-") {
        return Ok(None);
    }
    let sentiment = doc.get_i64("sentiment")? + 1;
    if !(0..LABELS.len() as i64).contains(&sentiment) {
        bail!("sentiment {} is outside -1..=1", sentiment - 1);
    }
    doc.insert("text", text);
    doc.insert("sentiment", sentiment);
    Ok(Some(doc))
}

pub struct TweetSentBr {
    dataset: Dataset,
    scoring: Scoring,
}

impl TweetSentBr {
    pub fn load(data_dir: &Path, scoring: Scoring) -> Self {
        Self::from_dataset(
            Dataset::new(data_dir, "tweetsentbr").with_prepare(prepare),
            scoring,
        )
    }

    pub fn from_dataset(dataset: Dataset, scoring: Scoring) -> Self {
        Self { dataset, scoring }
    }

    pub const fn name(scoring: Scoring) -> &'static str {
        match scoring {
            Scoring::Loglikelihood => "tweetsentbr",
            Scoring::Greedy => "tweetsentbr_greedy",
        }
    }

    fn gold(doc: &Document) -> Result<usize> {
        let gold = doc.get_usize("sentiment")?;
        if gold >= LABELS.len() {
            bail!("sentiment {gold} is not 0, 1 or 2");
        }
        Ok(gold)
    }
}

impl Display for TweetSentBr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Self::name(self.scoring))
    }
}

impl Task for TweetSentBr {
    dataset_splits! {
        has_training_docs, training_docs => Split::Train;
        has_validation_docs, validation_docs => Split::Test;
        has_test_docs, test_docs => Split::Test;
    }

    fn doc_to_text(&self, doc: &Document) -> Result<String> {
        Ok(format!("Mensagem: \"{}\".\nResposta:", doc.get_str("text")?))
    }

    fn doc_to_target(&self, doc: &Document) -> Result<String> {
        Ok(LABELS[Self::gold(doc)?].to_owned())
    }

    fn manual_examples(&self) -> Result<&[Document]> {
        self.dataset.manual()
    }

    fn similarity_index(&self) -> Result<Option<&dyn SimilarityIndex>> {
        Ok(Some(self.dataset.lexical_index(&KEYS_TO_INDEX)? as &dyn SimilarityIndex))
    }

    fn searcher_k(&self) -> usize {
        SEARCHER_K
    }

    fn construct_requests(&self, _doc: &Document, ctx: &Prompt) -> Result<Vec<Request>> {
        Ok(match self.scoring {
            Scoring::Loglikelihood => LABELS
                .iter()
                .map(|label| Request::loglikelihood(ctx, *label))
                .collect(),
            Scoring::Greedy => vec![Request::greedy_until(ctx, ["\n"])],
        })
    }

    fn process_results(&self, doc: &Document, responses: &[Response]) -> Result<Metrics> {
        let (hit, pair) = match self.scoring {
            Scoring::Loglikelihood => {
                let gold = Self::gold(doc)?;
                let pred = argmax(responses)?;
                (pred == gold, MetricSample::pair(pred, gold))
            }
            Scoring::Greedy => {
                let gold = self.doc_to_target(doc)?.trim().to_lowercase();
                let pred = generated_text(responses)?.trim().to_lowercase();
                (pred == gold, MetricSample::pair(pred, gold))
            }
        };
        Ok(Metrics::from([
            ("acc".to_string(), MetricSample::Scalar(if hit { 100.0 } else { 0.0 })),
            ("f1-macro".to_string(), pair.clone()),
            ("f1-weighted".to_string(), pair),
        ]))
    }

    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        IndexMap::from([
            ("acc".to_string(), Aggregation::Mean),
            ("f1-macro".to_string(), Aggregation::MacroF1),
            ("f1-weighted".to_string(), Aggregation::WeightedF1),
        ])
    }

    fn higher_is_better(&self) -> IndexMap<String, bool> {
        IndexMap::from([
            ("acc".to_string(), true),
            ("f1-macro".to_string(), true),
            ("f1-weighted".to_string(), true),
        ])
    }
}
