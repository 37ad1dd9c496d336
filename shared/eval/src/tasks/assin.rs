/**
       ASSIN 2: Portuguese sentence pairs annotated for entailment and for
       semantic relatedness on a 1 to 5 scale.

       Both tasks read `<data_dir>/assin2/{train,validation,test}.jsonl`, each with its
       own curated exemplars (`manual_rte.jsonl`, `manual_sts.jsonl`).
*/
use super::{argmax, dataset_splits, generated_text, Scoring};
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
use serde_json::json;
use std::{fmt::Display, path::Path};
use tracing::warn;

const DATASET: &str = "assin2";
const KEYS_TO_INDEX: [&str; 2] = ["premise", "hypothesis"];
const SEARCHER_K: usize = 600;

pub struct AssinRte {
    dataset: Dataset,
    scoring: Scoring,
}

const RTE_CHOICES: [&str; 2] = [" Não", " Sim"];

impl AssinRte {
    pub fn load(data_dir: &Path, scoring: Scoring) -> Self {
        Self::from_dataset(
            Dataset::new(data_dir, DATASET).with_manual_stem("manual_rte"),
            scoring,
        )
    }

    pub fn from_dataset(dataset: Dataset, scoring: Scoring) -> Self {
        Self { dataset, scoring }
    }

    pub const fn name(scoring: Scoring) -> &'static str {
        match scoring {
            Scoring::Loglikelihood => "assin_rte",
            Scoring::Greedy => "assin_rte_greedy",
        }
    }

    fn gold(doc: &Document) -> Result<usize> {
        let gold = doc.get_usize("entailment_judgment")?;
        if gold >= RTE_CHOICES.len() {
            bail!("entailment_judgment {gold} is not 0 or 1");
        }
        Ok(gold)
    }
}

impl Display for AssinRte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Self::name(self.scoring))
    }
}

impl Task for AssinRte {
    dataset_splits! {
        has_training_docs, training_docs => Split::Train;
        has_validation_docs, validation_docs => Split::Validation;
        has_test_docs, test_docs => Split::Test;
    }

    fn doc_to_text(&self, doc: &Document) -> Result<String> {
        Ok(format!(
            "Pergunta: Dado que \"{}\", é verdade que \"{}\"?\nResposta:",
            doc.get_str("premise")?,
            doc.get_str("hypothesis")?
        ))
    }

    fn doc_to_target(&self, doc: &Document) -> Result<String> {
        Ok(RTE_CHOICES[Self::gold(doc)?].to_owned())
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
            Scoring::Loglikelihood => RTE_CHOICES
                .iter()
                .map(|choice| Request::loglikelihood(ctx, *choice))
                .collect(),
            Scoring::Greedy => vec![Request::greedy_until(ctx, ["\n"])],
        })
    }

    fn process_results(&self, doc: &Document, responses: &[Response]) -> Result<Metrics> {
        let (hit, f1) = match self.scoring {
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
            ("f1".to_string(), f1),
        ]))
    }

    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        IndexMap::from([
            ("acc".to_string(), Aggregation::Mean),
            ("f1".to_string(), Aggregation::MacroF1),
        ])
    }

    fn higher_is_better(&self) -> IndexMap<String, bool> {
        IndexMap::from([("acc".to_string(), true), ("f1".to_string(), true)])
    }
}

pub struct AssinSts {
    dataset: Dataset,
    scoring: Scoring,
}

const STS_SCORES: [u8; 5] = [1, 2, 3, 4, 5];

impl AssinSts {
    pub fn load(data_dir: &Path, scoring: Scoring) -> Self {
        Self::from_dataset(
            Dataset::new(data_dir, DATASET).with_manual_stem("manual_sts"),
            scoring,
        )
    }

    pub fn from_dataset(dataset: Dataset, scoring: Scoring) -> Self {
        Self { dataset, scoring }
    }

    pub const fn name(scoring: Scoring) -> &'static str {
        match scoring {
            Scoring::Loglikelihood => "assin_sts",
            Scoring::Greedy => "assin_sts_greedy",
        }
    }

    /// Relatedness rounded half to even onto the 1-5 scale.
    fn sts_target(doc: &Document) -> Result<i64> {
        Ok(doc.get_f64("relatedness_score")?.round_ties_even() as i64)
    }
}

impl Display for AssinSts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Self::name(self.scoring))
    }
}

impl Task for AssinSts {
    dataset_splits! {
        has_training_docs, training_docs => Split::Train;
        has_validation_docs, validation_docs => Split::Validation;
        has_test_docs, test_docs => Split::Test;
    }

    fn doc_to_text(&self, doc: &Document) -> Result<String> {
        Ok(format!(
            "Sentença 1: {}\nSentença 2: {}\nResposta:",
            doc.get_str("premise")?,
            doc.get_str("hypothesis")?
        ))
    }

    fn doc_to_target(&self, doc: &Document) -> Result<String> {
        Ok(format!(" {}", Self::sts_target(doc)?))
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
            Scoring::Loglikelihood => STS_SCORES
                .iter()
                .map(|score| Request::loglikelihood(ctx, format!(" {score}")))
                .collect(),
            Scoring::Greedy => vec![Request::greedy_until(ctx, ["\n"])],
        })
    }

    fn process_results(&self, doc: &Document, responses: &[Response]) -> Result<Metrics> {
        let gold = doc.get_f64("relatedness_score")?;
        match self.scoring {
            Scoring::Loglikelihood => {
                let pred = f64::from(STS_SCORES[argmax(responses)?]);
                Ok(Metrics::from([
                    ("mse".to_string(), MetricSample::Scalar((gold - pred).powi(2))),
                    ("pearson".to_string(), MetricSample::pair(pred, gold)),
                ]))
            }
            Scoring::Greedy => {
                let text = generated_text(responses)?;
                // Unparseable answers score as far from the gold as the scale allows.
                let (pred, gold, unknown) = match text.trim().parse::<f64>() {
                    Ok(pred) => (pred, gold, 0.0),
                    Err(err) => {
                        warn!(
                            task = %self,
                            prediction = text,
                            error = %err,
                            "Could not parse similarity score"
                        );
                        (1.0, 5.0, 1.0)
                    }
                };
                Ok(Metrics::from([
                    ("mse".to_string(), MetricSample::Scalar((gold - pred).powi(2))),
                    ("pearson".to_string(), MetricSample::pair(pred, gold)),
                    (
                        "debug_info".to_string(),
                        MetricSample::Info(json!({"gold": gold, "pred": pred})),
                    ),
                    ("unknown_pred".to_string(), MetricSample::Scalar(unknown)),
                ]))
            }
        }
    }

    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        IndexMap::from([
            ("mse".to_string(), Aggregation::Mean),
            ("pearson".to_string(), Aggregation::Pearson),
            ("unknown_pred".to_string(), Aggregation::Mean),
        ])
    }

    fn higher_is_better(&self) -> IndexMap<String, bool> {
        IndexMap::from([
            ("mse".to_string(), false),
            ("pearson".to_string(), true),
            ("unknown_pred".to_string(), false),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn ll(logprob: f64) -> Response {
        Response::Loglikelihood {
            logprob,
            is_greedy: false,
        }
    }

    fn pair() -> Document {
        doc!({
            "premise": "Um homem está tocando violão",
            "hypothesis": "Alguém toca violão",
            "relatedness_score": 4.5,
            "entailment_judgment": 1
        })
    }

    #[test]
    fn rte_prompt_and_metrics() {
        let task = AssinRte::from_dataset(Dataset::in_memory(DATASET), Scoring::Loglikelihood);
        assert_eq!(
            task.doc_to_text(&pair()).unwrap(),
            "Pergunta: Dado que \"Um homem está tocando violão\", é verdade que \"Alguém toca violão\"?\nResposta:"
        );
        assert_eq!(task.doc_to_target(&pair()).unwrap(), " Sim");
        assert_eq!(task.searcher_k(), 600);

        let metrics = task.process_results(&pair(), &[ll(-3.0), ll(-0.1)]).unwrap();
        assert_eq!(metrics["acc"], MetricSample::Scalar(100.0));
        assert_eq!(metrics["f1"], MetricSample::pair(1, 1));
    }

    #[test]
    fn rte_greedy_compares_normalized_text() {
        let task = AssinRte::from_dataset(Dataset::in_memory(DATASET), Scoring::Greedy);
        let metrics = task
            .process_results(&pair(), &[Response::Text(" sim\n".into())])
            .unwrap();
        assert_eq!(metrics["acc"], MetricSample::Scalar(100.0));
        assert_eq!(metrics["f1"], MetricSample::pair("sim", "sim"));
    }

    #[rstest]
    #[case(4.5, " 4")]
    #[case(3.5, " 4")]
    #[case(4.7, " 5")]
    #[case(1.0, " 1")]
    fn sts_target_rounds_half_to_even(#[case] score: f64, #[case] expected: &str) {
        let task = AssinSts::from_dataset(Dataset::in_memory(DATASET), Scoring::Loglikelihood);
        let mut doc = pair();
        doc.insert("relatedness_score", score);
        assert_eq!(task.doc_to_target(&doc).unwrap(), expected);
    }

    #[test]
    fn sts_loglikelihood_picks_a_score() {
        let task = AssinSts::from_dataset(Dataset::in_memory(DATASET), Scoring::Loglikelihood);
        let ctx = Prompt::text("ctx");
        assert_eq!(task.construct_requests(&pair(), &ctx).unwrap().len(), 5);
        let responses = [-5.0, -4.0, -3.0, -0.5, -2.0].map(ll);
        let metrics = task.process_results(&pair(), &responses).unwrap();
        assert_eq!(metrics["mse"], MetricSample::Scalar(0.25));
        assert_eq!(metrics["pearson"], MetricSample::pair(4.0, 4.5));
        assert!(!metrics.contains_key("unknown_pred"));
    }

    #[test]
    fn sts_greedy_penalizes_unparseable_answers() {
        let task = AssinSts::from_dataset(Dataset::in_memory(DATASET), Scoring::Greedy);
        let parsed = task
            .process_results(&pair(), &[Response::Text(" 4.5".into())])
            .unwrap();
        assert_eq!(parsed["mse"], MetricSample::Scalar(0.0));
        assert_eq!(parsed["unknown_pred"], MetricSample::Scalar(0.0));

        let unknown = task
            .process_results(&pair(), &[Response::Text("muito similar".into())])
            .unwrap();
        assert_eq!(unknown["mse"], MetricSample::Scalar(16.0));
        assert_eq!(unknown["pearson"], MetricSample::pair(1.0, 5.0));
        assert_eq!(unknown["unknown_pred"], MetricSample::Scalar(1.0));
        assert_eq!(
            unknown["debug_info"],
            MetricSample::Info(json!({"gold": 5.0, "pred": 1.0}))
        );
    }
}
