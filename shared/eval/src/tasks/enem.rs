/**
       ENEM: multiple-choice questions (five options) from the Brazilian national
       high-school exam, 2009 to 2017.

       There is a single pool of questions; it serves both as the evaluation split and as
       the exemplar pool. Exemplars for a question always come from a different exam, and
       a handful of oversized questions are never used as exemplars.
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
use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::json;
use std::{fmt::Display, path::Path, sync::LazyLock};
use tracing::debug;

const KEYS_TO_INDEX: [&str; 2] = ["context", "question"];
const SEARCHER_K: usize = 10;
const LETTERS: [&str; 5] = ["A", "B", "C", "D", "E"];

pub const EXAMS: [&str; 10] = [
    "2009", "2010", "2011", "2012", "2013", "2014", "2015", "2016", "2016_2_", "2017",
];

/// Largest questions (over 600 tokens), never used as exemplars.
pub const TOO_LARGE: [&str; 10] = [
    "2013_59",
    "2010_121",
    "2009_132",
    "2009_133",
    "2016_2__104",
    "2009_130",
    "2015_108",
    "2009_131",
    "2011_128",
    "2014_135",
];

static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\n+\s*").expect("valid regex"));

// Answer letter, optionally introduced by "Letra" or "Alternativa", in decreasing order
// of specificity: "B.", then "b)", then a bare "B".
static LETTER_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:|[Ll]etra |[Aa]lternativa )([ABCDE])\.").expect("valid regex"));
static LETTER_PAREN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:|[Ll]etra |[Aa]lternativa )([ABCDEabcde])\)").expect("valid regex")
});
static BARE_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:|[Ll]etra |[Aa]lternativa )([ABCDE])").expect("valid regex"));

/// Joins lines, collapses repeated whitespace and trims the start.
fn normalize(text: &str) -> String {
    let joined = LINE_BREAKS.replace_all(text, " ");
    let mut out = String::with_capacity(joined.len());
    let mut previous: Option<char> = None;
    for c in joined.chars() {
        if c.is_whitespace() && previous == Some(c) {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out.trim_start().to_owned()
}

fn prepare(_split: Split, mut doc: Document) -> Result<Option<Document>> {
    let context = normalize(doc.get_str("context")?);
    let question = normalize(doc.get_str("question")?);
    let options: Vec<String> = doc
        .get_strings("options")?
        .iter()
        .map(|option| normalize(option))
        .collect();
    if options.len() != LETTERS.len() {
        bail!(
            "question {} has {} options instead of {}",
            doc.get_str("id")?,
            options.len(),
            LETTERS.len()
        );
    }
    let label = doc.get_str("label")?.to_lowercase();
    doc.insert("context", context);
    doc.insert("question", question);
    doc.insert("options", options);
    doc.insert("label", label);
    Ok(Some(doc))
}

/// Last match of `regex`'s first group in `text`.
fn last_capture<'t>(regex: &Regex, text: &'t str) -> Option<&'t str> {
    regex
        .captures_iter(text)
        .last()
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Answer letter in `prediction`, or the letter of the option it repeats verbatim.
pub fn extract_answer(prediction: &str, options: &[String]) -> Option<String> {
    if let Some(letter) = last_capture(&LETTER_DOT, prediction) {
        return Some(format!("{letter}."));
    }
    if let Some(letter) = last_capture(&LETTER_PAREN, prediction) {
        return Some(format!("{}.", letter.to_uppercase()));
    }
    if let Some(letter) = last_capture(&BARE_LETTER, prediction) {
        return Some(format!("{letter}."));
    }
    options
        .iter()
        .position(|option| option == prediction)
        .and_then(|i| LETTERS.get(i))
        .map(|letter| format!("{letter}."))
}

pub struct Enem {
    dataset: Dataset,
    scoring: Scoring,
}

impl Enem {
    pub fn load(data_dir: &Path, scoring: Scoring) -> Self {
        Self::from_dataset(Dataset::new(data_dir, "enem").with_prepare(prepare), scoring)
    }

    pub fn from_dataset(dataset: Dataset, scoring: Scoring) -> Self {
        Self { dataset, scoring }
    }

    pub const fn name(scoring: Scoring) -> &'static str {
        match scoring {
            Scoring::Loglikelihood => "enem",
            Scoring::Greedy => "enem_greedy",
        }
    }

    fn gold(doc: &Document) -> Result<usize> {
        let label = doc.get_str("label")?;
        LETTERS
            .iter()
            .position(|letter| letter.eq_ignore_ascii_case(label))
            .ok_or_else(|| anyhow!("label {label} is not one of a-e"))
    }

    fn options(doc: &Document) -> Result<Vec<String>> {
        let options = doc.get_strings("options")?;
        if options.len() != LETTERS.len() {
            bail!("expected {} options, got {}", LETTERS.len(), options.len());
        }
        Ok(options)
    }

    fn per_metric<T: Copy>(head: &[&str], value: T) -> IndexMap<String, T> {
        head.iter()
            .copied()
            .chain(EXAMS)
            .map(|metric| (metric.to_string(), value))
            .collect()
    }
}

impl Display for Enem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Self::name(self.scoring))
    }
}

impl Task for Enem {
    dataset_splits! {
        has_training_docs, training_docs => Split::Train;
        has_test_docs, test_docs => Split::Train;
    }

    fn has_validation_docs(&self) -> bool {
        false
    }

    fn doc_to_text(&self, doc: &Document) -> Result<String> {
        let mut prompt = format!(
            "Cabeçalho: {}\nEnunciado: {}\nAlternativas:\n",
            doc.get_str("context")?,
            doc.get_str("question")?
        );
        for (letter, option) in LETTERS.iter().zip(Self::options(doc)?) {
            prompt.push_str(&format!("{letter}. {option}\n"));
        }
        prompt.push_str("Resposta:");
        Ok(prompt)
    }

    fn doc_to_target(&self, doc: &Document) -> Result<String> {
        let gold = Self::gold(doc)?;
        Ok(match self.scoring {
            Scoring::Loglikelihood => format!(" {}", Self::options(doc)?[gold]),
            Scoring::Greedy => format!(" {}.", LETTERS[gold]),
        })
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

    fn is_eligible_exemplar(&self, target: &Document, candidate: &Document) -> bool {
        let oversized = candidate
            .get_str("id")
            .is_ok_and(|id| TOO_LARGE.contains(&id));
        candidate.get_str("exam").ok() != target.get_str("exam").ok() && !oversized
    }

    fn construct_requests(&self, doc: &Document, ctx: &Prompt) -> Result<Vec<Request>> {
        Ok(match self.scoring {
            Scoring::Loglikelihood => Self::options(doc)?
                .iter()
                .map(|option| Request::loglikelihood(ctx, format!(" {option}")))
                .collect(),
            Scoring::Greedy => vec![Request::greedy_until(ctx, ["\n"])],
        })
    }

    fn process_results(&self, doc: &Document, responses: &[Response]) -> Result<Metrics> {
        let gold = Self::gold(doc)?;
        let exam = doc.get_str("exam")?.to_owned();
        let options = Self::options(doc)?;
        match self.scoring {
            Scoring::Loglikelihood => {
                let acc = argmax(responses)? == gold;
                let normalized = responses
                    .iter()
                    .zip(&options)
                    .map(|(response, option)| {
                        let logprob = response
                            .as_f64()
                            .ok_or_else(|| anyhow!("expected a loglikelihood, got {response}"))?;
                        Ok(Response::Score(
                            logprob / option.chars().count().max(1) as f64,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let acc_norm = argmax(&normalized)? == gold;
                Ok(Metrics::from([
                    ("acc".to_string(), acc.into()),
                    ("acc_norm".to_string(), acc_norm.into()),
                    (exam, acc_norm.into()),
                ]))
            }
            Scoring::Greedy => {
                let gold = format!("{}.", LETTERS[gold]);
                let text = generated_text(responses)?;
                let pred = extract_answer(text, &options);
                if pred.is_none() {
                    debug!(task = %self, prediction = text, %gold, %exam, "No answer letter found");
                }
                let unknown = pred.is_none();
                let pred = pred.unwrap_or_default();
                let acc = pred == gold;
                Ok(Metrics::from([
                    ("acc".to_string(), acc.into()),
                    (exam, acc.into()),
                    ("unknown_pred".to_string(), unknown.into()),
                    (
                        "debug_info".to_string(),
                        MetricSample::Info(json!({"gold": gold, "pred": pred})),
                    ),
                ]))
            }
        }
    }

    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        match self.scoring {
            Scoring::Loglikelihood => Self::per_metric(&["acc", "acc_norm"], Aggregation::Mean),
            Scoring::Greedy => Self::per_metric(&["acc", "unknown_pred"], Aggregation::Mean),
        }
    }

    fn higher_is_better(&self) -> IndexMap<String, bool> {
        let mut higher = match self.scoring {
            Scoring::Loglikelihood => Self::per_metric(&["acc", "acc_norm"], true),
            Scoring::Greedy => Self::per_metric(&["acc", "unknown_pred"], true),
        };
        if let Some(unknown) = higher.get_mut("unknown_pred") {
            *unknown = false;
        }
        higher
    }
}
