use crate::prompt::Prompt;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Loglikelihood,
    GreedyUntil,
    LoglikelihoodRolling,
}

impl RequestKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Loglikelihood => "loglikelihood",
            RequestKind::GreedyUntil => "greedy_until",
            RequestKind::LoglikelihoodRolling => "loglikelihood_rolling",
        }
    }

    /// Generation-style requests have their prompt and prediction written to the sample log.
    pub const fn is_generation(&self) -> bool {
        matches!(self, RequestKind::GreedyUntil)
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestArgs {
    /// Log-probability of `continuation` given `context`.
    Loglikelihood { context: Prompt, continuation: String },
    /// Greedy decoding from `context` until any string in `until` is produced.
    GreedyUntil { context: Prompt, until: Vec<String> },
    /// Log-probability of the whole text, with no conditioning context.
    LoglikelihoodRolling { text: String },
}

impl RequestArgs {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestArgs::Loglikelihood { .. } => RequestKind::Loglikelihood,
            RequestArgs::GreedyUntil { .. } => RequestKind::GreedyUntil,
            RequestArgs::LoglikelihoodRolling { .. } => RequestKind::LoglikelihoodRolling,
        }
    }

    pub fn prompt(&self) -> Option<&Prompt> {
        match self {
            RequestArgs::Loglikelihood { context, .. } | RequestArgs::GreedyUntil { context, .. } => {
                Some(context)
            }
            RequestArgs::LoglikelihoodRolling { .. } => None,
        }
    }

    /// Length used to order requests for batching.
    pub fn input_len(&self) -> usize {
        match self {
            RequestArgs::Loglikelihood {
                context,
                continuation,
            } => context.len() + continuation.chars().count(),
            RequestArgs::GreedyUntil { context, .. } => context.len(),
            RequestArgs::LoglikelihoodRolling { text } => text.chars().count(),
        }
    }

    /// Requests of one kind may only share a backend call when this key is equal.
    pub fn grouping_key(&self) -> &[String] {
        match self {
            RequestArgs::GreedyUntil { until, .. } => until,
            RequestArgs::Loglikelihood { .. } | RequestArgs::LoglikelihoodRolling { .. } => &[],
        }
    }
}

/// One atomic call to the model backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub args: RequestArgs,
    /// Selects one element when the backend returns a multi-valued response.
    pub index: Option<usize>,
}

impl Request {
    pub fn loglikelihood(context: &Prompt, continuation: impl Into<String>) -> Self {
        Self {
            args: RequestArgs::Loglikelihood {
                context: context.clone(),
                continuation: continuation.into(),
            },
            index: None,
        }
    }

    pub fn greedy_until<S: Into<String>>(
        context: &Prompt,
        until: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            args: RequestArgs::GreedyUntil {
                context: context.clone(),
                until: until.into_iter().map(Into::into).collect(),
            },
            index: None,
        }
    }

    pub fn loglikelihood_rolling(text: impl Into<String>) -> Self {
        Self {
            args: RequestArgs::LoglikelihoodRolling { text: text.into() },
            index: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.args.kind()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseError {
    #[error("response {response:?} has no element at index {index}")]
    NoSuchElement { response: Response, index: usize },
}

/// What the backend returned for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Loglikelihood { logprob: f64, is_greedy: bool },
    Text(String),
    Score(f64),
    Flag(bool),
}

impl Response {
    /// Element `index` of a multi-valued response. Single-valued responses only have index 0.
    pub fn select(self, index: usize) -> Result<Response, ResponseError> {
        match (self, index) {
            (Response::Loglikelihood { logprob, .. }, 0) => Ok(Response::Score(logprob)),
            (Response::Loglikelihood { is_greedy, .. }, 1) => Ok(Response::Flag(is_greedy)),
            (response @ Response::Loglikelihood { .. }, index) => {
                Err(ResponseError::NoSuchElement { response, index })
            }
            (response, 0) => Ok(response),
            (response, index) => Err(ResponseError::NoSuchElement { response, index }),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Response::Loglikelihood { logprob, .. } => Some(*logprob),
            Response::Score(score) => Some(*score),
            Response::Text(_) | Response::Flag(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Loglikelihood { logprob, is_greedy } => {
                write!(f, "({logprob}, {is_greedy})")
            }
            Response::Text(text) => write!(f, "{text}"),
            Response::Score(score) => write!(f, "{score}"),
            Response::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

/// The model side of an evaluation. One call per batch; the returned list must have the same
/// length and order as `batch`. Every element of `batch` has kind `kind`.
pub trait Backend {
    fn name(&self) -> &str;

    fn execute(&mut self, kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn execute(&mut self, kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
        (**self).execute(kind, batch)
    }
}
