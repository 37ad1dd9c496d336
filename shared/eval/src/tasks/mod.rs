use crate::{harness::HarnessError, request::Response, traits::Task};
use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use std::path::Path;

mod assin;
mod boolq_pt;
mod enem;
mod tweetsentbr;

pub use assin::{AssinRte, AssinSts};
pub use boolq_pt::BoolQPt;
pub use enem::Enem;
pub use tweetsentbr::TweetSentBr;

/// How a task asks the model for its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scoring {
    /// One loglikelihood request per answer choice, prediction is the argmax.
    Loglikelihood,
    /// One generation request, prediction is parsed from the text.
    Greedy,
}

impl Scoring {
    pub const fn is_greedy(&self) -> bool {
        matches!(self, Scoring::Greedy)
    }
}

pub const ALL_TASKS: &str = "all_tasks";

pub const ALL_TASK_NAMES: [&str; 10] = [
    AssinRte::name(Scoring::Loglikelihood),
    AssinRte::name(Scoring::Greedy),
    AssinSts::name(Scoring::Loglikelihood),
    AssinSts::name(Scoring::Greedy),
    BoolQPt::name(Scoring::Loglikelihood),
    BoolQPt::name(Scoring::Greedy),
    Enem::name(Scoring::Loglikelihood),
    Enem::name(Scoring::Greedy),
    TweetSentBr::name(Scoring::Loglikelihood),
    TweetSentBr::name(Scoring::Greedy),
];

/// Split accessors of a task that owns a `dataset: Dataset` field.
macro_rules! dataset_splits {
    ($($has:ident, $docs:ident => $split:expr;)+) => {
        $(
            fn $has(&self) -> bool {
                self.dataset.has_split($split)
            }

            fn $docs(&self) -> anyhow::Result<&[$crate::Document]> {
                self.dataset.docs($split)
            }
        )+
    };
}
pub(crate) use dataset_splits;

pub fn task_from_name(name: &str, data_dir: &Path) -> Result<Box<dyn Task>> {
    use Scoring::*;
    let task: Box<dyn Task> = match name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .as_str()
    {
        "assin_rte" => Box::new(AssinRte::load(data_dir, Loglikelihood)),
        "assin_rte_greedy" => Box::new(AssinRte::load(data_dir, Greedy)),
        "assin_sts" => Box::new(AssinSts::load(data_dir, Loglikelihood)),
        "assin_sts_greedy" => Box::new(AssinSts::load(data_dir, Greedy)),
        "boolq_pt" => Box::new(BoolQPt::load(data_dir, Loglikelihood)),
        "boolq_pt_greedy" => Box::new(BoolQPt::load(data_dir, Greedy)),
        "enem" => Box::new(Enem::load(data_dir, Loglikelihood)),
        "enem_greedy" => Box::new(Enem::load(data_dir, Greedy)),
        "tweetsentbr" => Box::new(TweetSentBr::load(data_dir, Loglikelihood)),
        "tweetsentbr_greedy" => Box::new(TweetSentBr::load(data_dir, Greedy)),
        _ => {
            return Err(HarnessError::UnknownTask {
                name: name.to_owned(),
                available: ALL_TASK_NAMES.map(String::from).to_vec(),
            }
            .into())
        }
    };
    Ok(task)
}

/// Tasks keyed by registry name, in the order given. `all_tasks` expands to every task.
pub fn get_task_dict(names: &[String], data_dir: &Path) -> Result<IndexMap<String, Box<dyn Task>>> {
    let mut tasks = IndexMap::new();
    for name in names {
        if name == ALL_TASKS {
            for name in ALL_TASK_NAMES {
                if !tasks.contains_key(name) {
                    tasks.insert(name.to_owned(), task_from_name(name, data_dir)?);
                }
            }
            continue;
        }
        let task = task_from_name(name, data_dir)?;
        tasks.entry(task.to_string()).or_insert(task);
    }
    Ok(tasks)
}

/// Index of the most likely continuation among loglikelihood responses.
pub(crate) fn argmax(responses: &[Response]) -> Result<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, response) in responses.iter().enumerate() {
        let logprob = response
            .as_f64()
            .ok_or_else(|| anyhow!("expected a loglikelihood, got {response}"))?;
        if best.map_or(true, |(_, max)| logprob > max) {
            best = Some((i, logprob));
        }
    }
    best.map(|(i, _)| i)
        .ok_or_else(|| anyhow!("no responses to choose from"))
}

/// The text of the single generation response.
pub(crate) fn generated_text(responses: &[Response]) -> Result<&str> {
    match responses {
        [response] => response
            .as_text()
            .ok_or_else(|| anyhow!("expected generated text, got {response}")),
        _ => Err(anyhow!(
            "expected exactly one generation, got {}",
            responses.len()
        )),
    }
}

/// Replaces every run of one repeated whitespace character with a single space.
pub(crate) fn squeeze_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous: Option<char> = None;
    for c in text.chars() {
        if c.is_whitespace() {
            if previous != Some(c) {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
        previous = Some(c);
    }
    out
}
