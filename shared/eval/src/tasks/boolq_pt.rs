/**
       Portuguese translation of BoolQ, yes/no questions over a Wikipedia passage.

       Training passages are limited to the shortest three quarters (< 749 chars) so that
       exemplars fit the context; validation passages are cut at 1169 chars.
*/
use super::{argmax, dataset_splits, generated_text, Scoring};
use crate::{
    dataset::{Dataset, Split},
    fewshot::SimilarityIndex,
    metrics::{Aggregation, Metrics},
    prompt::Prompt,
    request::{Request, Response},
    traits::Task,
    Document,
};
use anyhow::Result;
use indexmap::IndexMap;
use std::{fmt::Display, path::Path};

const MAX_TRAIN_PASSAGE_CHARS: usize = 749;
const MAX_VALIDATION_PASSAGE_CHARS: usize = 1169;
const KEYS_TO_INDEX: [&str; 2] = ["question", "passage"];
const CHOICES: [&str; 2] = [" não", " sim"];

pub struct BoolQPt {
    dataset: Dataset,
    scoring: Scoring,
}

fn prepare(split: Split, mut doc: Document) -> Result<Option<Document>> {
    let passage = doc.get_str("passage")?;
    match split {
        Split::Train if passage.chars().count() >= MAX_TRAIN_PASSAGE_CHARS => Ok(None),
        Split::Validation => {
            let truncated: String = passage.chars().take(MAX_VALIDATION_PASSAGE_CHARS).collect();
            doc.insert("passage", truncated);
            Ok(Some(doc))
        }
        _ => Ok(Some(doc)),
    }
}

impl BoolQPt {
    pub fn load(data_dir: &Path, scoring: Scoring) -> Self {
        Self::from_dataset(Dataset::new(data_dir, "boolq_pt").with_prepare(prepare), scoring)
    }

    pub fn from_dataset(dataset: Dataset, scoring: Scoring) -> Self {
        Self { dataset, scoring }
    }

    pub const fn name(scoring: Scoring) -> &'static str {
        match scoring {
            Scoring::Loglikelihood => "boolq_pt",
            Scoring::Greedy => "boolq_pt_greedy",
        }
    }
}

impl Display for BoolQPt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Self::name(self.scoring))
    }
}

impl Task for BoolQPt {
    dataset_splits! {
        has_training_docs, training_docs => Split::Train;
        has_validation_docs, validation_docs => Split::Validation;
    }

    fn has_test_docs(&self) -> bool {
        false
    }

    fn doc_to_text(&self, doc: &Document) -> Result<String> {
        Ok(format!(
            "Pergunta: {}\nContexto: {}\nResposta:",
            doc.get_str("question")?,
            doc.get_str("passage")?
        ))
    }

    fn doc_to_target(&self, doc: &Document) -> Result<String> {
        Ok(CHOICES[doc.get_bool("answer")? as usize].to_owned())
    }

    fn manual_examples(&self) -> Result<&[Document]> {
        self.dataset.manual()
    }

    fn similarity_index(&self) -> Result<Option<&dyn SimilarityIndex>> {
        Ok(Some(self.dataset.lexical_index(&KEYS_TO_INDEX)? as &dyn SimilarityIndex))
    }

    fn construct_requests(&self, _doc: &Document, ctx: &Prompt) -> Result<Vec<Request>> {
        Ok(match self.scoring {
            Scoring::Loglikelihood => CHOICES
                .iter()
                .map(|choice| Request::loglikelihood(ctx, *choice))
                .collect(),
            Scoring::Greedy => vec![Request::greedy_until(ctx, ["\n"])],
        })
    }

    fn process_results(&self, doc: &Document, responses: &[Response]) -> Result<Metrics> {
        let acc = match self.scoring {
            Scoring::Loglikelihood => argmax(responses)? == doc.get_bool("answer")? as usize,
            Scoring::Greedy => {
                let gold = self.doc_to_target(doc)?.trim().to_lowercase();
                generated_text(responses)?.trim().to_lowercase() == gold
            }
        };
        Ok(Metrics::from([("acc".to_string(), acc.into())]))
    }

    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        IndexMap::from([("acc".to_string(), Aggregation::Mean)])
    }

    fn higher_is_better(&self) -> IndexMap<String, bool> {
        IndexMap::from([("acc".to_string(), true)])
    }
}
