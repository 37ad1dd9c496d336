use crate::{
    aggregator::{Aggregator, DEFAULT_BOOTSTRAP_ITERS, DEFAULT_BOOTSTRAP_SEED},
    dispatcher::Dispatcher,
    fewshot::PromptMode,
    prompt::{ConversationTemplate, PromptStyle},
    report::{EvalResults, ModeResults},
    request::{Backend, Request, RequestKind},
    router::{RequestOrigin, ResultRouter, ScoredSamples},
    sample_log::SampleLog,
    tasks::get_task_dict,
    traits::Task,
    Document,
};
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use poeta_core::Sampler;
use serde::Serialize;
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_FEWSHOT_SEED: u64 = 1234;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    #[error("task {0} has neither test nor validation docs")]
    NoDocsAvailable(String),

    #[error("unknown task {name}, available tasks: {}", available.join(", "))]
    UnknownTask {
        name: String,
        available: Vec<String>,
    },

    #[error("no tasks to evaluate")]
    NoTasks,

    #[error("no prompt modes to evaluate")]
    NoPromptModes,

    #[error("{task_name}/{prompt_mode} cannot go from {from} back to {to}")]
    StateRegression {
        task_name: String,
        prompt_mode: PromptMode,
        from: EvalState,
        to: EvalState,
    },

    #[error("{task_name}/{prompt_mode} cannot skip from {from} to {to}")]
    StateSkipped {
        task_name: String,
        prompt_mode: PromptMode,
        from: EvalState,
        to: EvalState,
    },

    #[error("{task_name}/{prompt_mode} was never started")]
    NotStarted {
        task_name: String,
        prompt_mode: PromptMode,
    },

    #[error("{task_name}/{prompt_mode} stopped at {state}")]
    Incomplete {
        task_name: String,
        prompt_mode: PromptMode,
        state: EvalState,
    },

    #[error("{task_name} built no requests for doc {doc_id}")]
    NoRequests { task_name: String, doc_id: usize },
}

/// Progress of one (task, prompt mode) through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EvalState {
    PendingDocs,
    RequestsBuilt,
    RequestsDispatched,
    ResultsRouted,
    Aggregated,
}

impl EvalState {
    pub const fn next(&self) -> Option<EvalState> {
        match self {
            EvalState::PendingDocs => Some(EvalState::RequestsBuilt),
            EvalState::RequestsBuilt => Some(EvalState::RequestsDispatched),
            EvalState::RequestsDispatched => Some(EvalState::ResultsRouted),
            EvalState::ResultsRouted => Some(EvalState::Aggregated),
            EvalState::Aggregated => None,
        }
    }
}

impl Display for EvalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EvalState::PendingDocs => "PENDING_DOCS",
            EvalState::RequestsBuilt => "REQUESTS_BUILT",
            EvalState::RequestsDispatched => "REQUESTS_DISPATCHED",
            EvalState::ResultsRouted => "RESULTS_ROUTED",
            EvalState::Aggregated => "AGGREGATED",
        };
        write!(f, "{name}")
    }
}

/// Forward-only state per (task, prompt mode).
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    states: IndexMap<(String, PromptMode), EvalState>,
}

impl StateTracker {
    pub fn start(&mut self, task_name: &str, prompt_mode: PromptMode) -> Result<(), HarnessError> {
        let key = (task_name.to_owned(), prompt_mode);
        if let Some(&from) = self.states.get(&key) {
            return Err(HarnessError::StateRegression {
                task_name: key.0,
                prompt_mode,
                from,
                to: EvalState::PendingDocs,
            });
        }
        self.states.insert(key, EvalState::PendingDocs);
        Ok(())
    }

    pub fn advance(
        &mut self,
        task_name: &str,
        prompt_mode: PromptMode,
        to: EvalState,
    ) -> Result<(), HarnessError> {
        let Some(state) = self.states.get_mut(&(task_name.to_owned(), prompt_mode)) else {
            return Err(HarnessError::NotStarted {
                task_name: task_name.to_owned(),
                prompt_mode,
            });
        };
        let from = *state;
        if to <= from {
            return Err(HarnessError::StateRegression {
                task_name: task_name.to_owned(),
                prompt_mode,
                from,
                to,
            });
        }
        if from.next() != Some(to) {
            return Err(HarnessError::StateSkipped {
                task_name: task_name.to_owned(),
                prompt_mode,
                from,
                to,
            });
        }
        *state = to;
        tracing::trace!(task = task_name, %prompt_mode, state = %to, "State transition");
        Ok(())
    }

    pub fn advance_all(&mut self, to: EvalState) -> Result<(), HarnessError> {
        let keys: Vec<(String, PromptMode)> = self.states.keys().cloned().collect();
        for (task_name, prompt_mode) in keys {
            self.advance(&task_name, prompt_mode, to)?;
        }
        Ok(())
    }

    pub fn state(&self, task_name: &str, prompt_mode: PromptMode) -> Option<EvalState> {
        self.states
            .get(&(task_name.to_owned(), prompt_mode))
            .copied()
    }

    pub fn ensure_complete(&self) -> Result<(), HarnessError> {
        match self
            .states
            .iter()
            .find(|(_, state)| **state != EvalState::Aggregated)
        {
            Some(((task_name, prompt_mode), state)) => Err(HarnessError::Incomplete {
                task_name: task_name.clone(),
                prompt_mode: *prompt_mode,
                state: *state,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub num_fewshot: usize,
    pub prompt_modes: Vec<PromptMode>,
    pub limit: Option<usize>,
    pub bootstrap_iters: usize,
    pub bootstrap_seed: u64,
    /// Seed of the per-document exemplar samplers.
    pub fewshot_seed: u64,
    /// task name -> description placed before the exemplars.
    pub description_dict: IndexMap<String, String>,
    pub conversation_template: Option<ConversationTemplate>,
    pub prompt_as_single_user_message: bool,
    /// Where generation samples are logged; `None` disables the sample log.
    pub output_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub progress_bar: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            num_fewshot: 0,
            prompt_modes: vec![PromptMode::DynamicRandom],
            limit: None,
            bootstrap_iters: DEFAULT_BOOTSTRAP_ITERS,
            bootstrap_seed: DEFAULT_BOOTSTRAP_SEED,
            fewshot_seed: DEFAULT_FEWSHOT_SEED,
            description_dict: IndexMap::new(),
            conversation_template: None,
            prompt_as_single_user_message: false,
            output_dir: None,
            batch_size: None,
            progress_bar: false,
        }
    }
}

impl EvalConfig {
    pub fn prompt_style(&self) -> PromptStyle {
        PromptStyle {
            conversation_template: self.conversation_template,
            as_single_user_message: self.prompt_as_single_user_message,
            description_as_system: true,
        }
    }

    /// The task's description; `X_greedy` falls back to the description of `X`.
    pub fn description_for(&self, task_name: &str) -> &str {
        self.description_dict
            .get(task_name)
            .or_else(|| {
                task_name
                    .strip_suffix("_greedy")
                    .and_then(|base| self.description_dict.get(base))
            })
            .map(String::as_str)
            .unwrap_or("")
    }

    fn unique_prompt_modes(&self) -> Vec<PromptMode> {
        let mut modes = Vec::with_capacity(self.prompt_modes.len());
        for mode in &self.prompt_modes {
            if !modes.contains(mode) {
                modes.push(*mode);
            }
        }
        modes
    }
}

/// Reads a JSON object of `task name -> description`.
pub fn load_description_dict(path: &Path) -> Result<IndexMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading description dict {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| {
        format!(
            "description dict {} is not a JSON object of strings",
            path.display()
        )
    })
}

/// Test docs when present, otherwise validation docs.
pub fn eval_docs<'a>(task: &'a dyn Task, task_name: &str) -> Result<&'a [Document]> {
    if task.has_test_docs() {
        task.test_docs()
    } else if task.has_validation_docs() {
        task.validation_docs()
    } else {
        Err(HarnessError::NoDocsAvailable(task_name.to_owned()).into())
    }
}

/// Pre-flight for one task: docs load, the first document renders a prompt and requests
/// under every prompt mode, and every reported metric has an aggregation.
pub fn check_integrity(task: &dyn Task, task_name: &str, config: &EvalConfig) -> Result<()> {
    let docs = eval_docs(task, task_name)?;
    let Some(doc) = docs.first() else {
        bail!("{task_name}: evaluation split is empty");
    };
    for prompt_mode in config.unique_prompt_modes() {
        let mut sampler = Sampler::for_stream(config.fewshot_seed, 0);
        let ctx = task
            .fewshot_context(
                doc,
                config.num_fewshot,
                prompt_mode,
                &mut sampler,
                config.description_for(task_name),
                config.prompt_style(),
            )
            .with_context(|| format!("{task_name}/{prompt_mode}: building prompt"))?;
        if task.construct_requests(doc, &ctx)?.is_empty() {
            return Err(HarnessError::NoRequests {
                task_name: task_name.to_owned(),
                doc_id: 0,
            }
            .into());
        }
    }
    let aggregations = task.aggregation();
    for metric in task.higher_is_better().keys() {
        if !aggregations.contains_key(metric) {
            bail!("{task_name}: metric {metric} has no aggregation");
        }
    }
    info!(task = task_name, "Integrity check passed");
    Ok(())
}

struct BuiltDoc<'a> {
    task_name: &'a str,
    prompt_mode: PromptMode,
    document: &'a Document,
    doc_id: usize,
    requests: Vec<Request>,
}

impl<'a> BuiltDoc<'a> {
    fn origin(&self, sub_index: usize) -> RequestOrigin<'a> {
        RequestOrigin {
            sub_index,
            task_name: self.task_name,
            prompt_mode: self.prompt_mode,
            document: self.document,
            doc_id: self.doc_id,
        }
    }
}

/// Runs every task under every prompt mode against `backend`.
pub fn evaluate(
    tasks: &IndexMap<String, Box<dyn Task>>,
    backend: &mut dyn Backend,
    config: &EvalConfig,
) -> Result<EvalResults> {
    if tasks.is_empty() {
        return Err(HarnessError::NoTasks.into());
    }
    let prompt_modes = config.unique_prompt_modes();
    if prompt_modes.is_empty() {
        return Err(HarnessError::NoPromptModes.into());
    }
    let sample_log = config
        .output_dir
        .as_deref()
        .map(SampleLog::create)
        .transpose()?;

    let mut states = StateTracker::default();
    let mut versions = IndexMap::new();
    let mut built: Vec<BuiltDoc> = Vec::new();

    for (task_name, task) in tasks {
        versions.insert(task_name.clone(), task.version());
        let docs = eval_docs(task.as_ref(), task_name)?;
        let description = config.description_for(task_name);

        for &prompt_mode in &prompt_modes {
            states.start(task_name, prompt_mode)?;
            if let Some(log) = &sample_log {
                log.reset(task_name, prompt_mode)?;
            }

            let mut order: Vec<&Document> = docs.iter().collect();
            Sampler::document_order().shuffle(&mut order);
            if let Some(limit) = config.limit {
                order.truncate(limit);
            }
            info!(
                task = %task_name,
                %prompt_mode,
                docs = order.len(),
                num_fewshot = config.num_fewshot,
                "Building requests"
            );

            for (doc_id, document) in order.into_iter().enumerate() {
                let mut sampler = Sampler::for_stream(config.fewshot_seed, doc_id as u64);
                let ctx = task
                    .fewshot_context(
                        document,
                        config.num_fewshot,
                        prompt_mode,
                        &mut sampler,
                        description,
                        config.prompt_style(),
                    )
                    .with_context(|| format!("{task_name}/{prompt_mode} doc {doc_id}"))?;
                let requests = task.construct_requests(document, &ctx)?;
                if requests.is_empty() {
                    return Err(HarnessError::NoRequests {
                        task_name: task_name.clone(),
                        doc_id,
                    }
                    .into());
                }
                built.push(BuiltDoc {
                    task_name,
                    prompt_mode,
                    document,
                    doc_id,
                    requests,
                });
            }
            states.advance(task_name, prompt_mode, EvalState::RequestsBuilt)?;
        }
    }

    let mut router = ResultRouter::new();
    let mut by_kind: IndexMap<RequestKind, Vec<(&Request, RequestOrigin)>> = IndexMap::new();
    for doc in &built {
        router.register(&doc.origin(0), doc.requests.len());
        for (sub_index, request) in doc.requests.iter().enumerate() {
            by_kind
                .entry(request.kind())
                .or_default()
                .push((request, doc.origin(sub_index)));
        }
    }

    let dispatcher = Dispatcher::new(config.batch_size, config.progress_bar);
    for (kind, entries) in &by_kind {
        let requests: Vec<&Request> = entries.iter().map(|(request, _)| *request).collect();
        let responses = dispatcher.run(backend, *kind, &requests)?;
        for ((request, origin), response) in entries.iter().zip(responses) {
            router.record(origin, *request, response)?;
        }
    }
    states.advance_all(EvalState::RequestsDispatched)?;

    let scored = router.route(
        |name| tasks.get(name).map(|task| task.as_ref() as &dyn Task),
        sample_log.as_ref(),
    )?;
    states.advance_all(EvalState::ResultsRouted)?;

    let aggregator = Aggregator::new(config.bootstrap_iters, config.bootstrap_seed);
    let empty = ScoredSamples::default();
    let mut results: IndexMap<String, IndexMap<String, ModeResults>> = IndexMap::new();
    for (task_name, task) in tasks {
        for &prompt_mode in &prompt_modes {
            let group = scored
                .get(&(task_name.clone(), prompt_mode))
                .unwrap_or(&empty);
            let metrics = aggregator.aggregate(task.as_ref(), group)?;
            info!(task = %task_name, %prompt_mode, docs = group.num_docs, "Aggregated");
            results.entry(task_name.clone()).or_default().insert(
                prompt_mode.to_string(),
                ModeResults {
                    metrics,
                    num_examples: group.num_docs,
                },
            );
            states.advance(task_name, prompt_mode, EvalState::Aggregated)?;
        }
    }
    states.ensure_complete()?;

    Ok(EvalResults {
        results,
        versions,
        config: None,
    })
}

/// Resolves task names against `data_dir`, optionally checks them, and evaluates.
pub fn simple_evaluate(
    task_names: &[String],
    data_dir: &Path,
    backend: &mut dyn Backend,
    config: &EvalConfig,
    check: bool,
) -> Result<EvalResults> {
    let tasks = get_task_dict(task_names, data_dir)?;
    if check {
        for (task_name, task) in &tasks {
            check_integrity(task.as_ref(), task_name, config)?;
        }
    }
    evaluate(&tasks, backend, config)
}
