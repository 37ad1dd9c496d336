use crate::{
    fewshot::{ExemplarSource, PromptMode, SimilarityIndex},
    metrics::{Aggregation, Metrics},
    prompt::{assemble, Prompt, PromptStyle, RenderedExemplar},
    request::{Request, Response},
    Document,
};
use anyhow::{bail, Result};
use indexmap::IndexMap;
use poeta_core::Sampler;
use std::fmt::Display;

/// A benchmark: its documents, how to prompt for them, and how to score the answers.
///
/// `Display` is the registry name of the task.
pub trait Task: Send + Sync + Display {
    fn version(&self) -> u32 {
        0
    }

    fn has_training_docs(&self) -> bool;
    fn has_validation_docs(&self) -> bool;
    fn has_test_docs(&self) -> bool;

    fn training_docs(&self) -> Result<&[Document]> {
        bail!("{self} has no training docs")
    }

    fn validation_docs(&self) -> Result<&[Document]> {
        bail!("{self} has no validation docs")
    }

    fn test_docs(&self) -> Result<&[Document]> {
        bail!("{self} has no test docs")
    }

    fn doc_to_text(&self, doc: &Document) -> Result<String>;
    fn doc_to_target(&self, doc: &Document) -> Result<String>;

    /// Candidates for `fixed`, `dynamic-random` and `dynamic-similar` exemplars.
    fn fewshot_pool(&self) -> Result<&[Document]> {
        self.training_docs()
    }

    /// Curated exemplars for `manual` mode.
    fn manual_examples(&self) -> Result<&[Document]> {
        Ok(&[])
    }

    /// Ranks [`Task::fewshot_pool`] entries for `dynamic-similar`. Built lazily by the task.
    fn similarity_index(&self) -> Result<Option<&dyn SimilarityIndex>> {
        Ok(None)
    }

    /// How many similarity hits to request before filtering.
    fn searcher_k(&self) -> usize {
        10
    }

    /// Pool prefix `fixed` mode draws from; `None` is a prefix of exactly `k`.
    fn fixed_prefix(&self) -> Option<usize> {
        None
    }

    /// Whether `candidate` may serve as an exemplar for `target`.
    fn is_eligible_exemplar(&self, _target: &Document, _candidate: &Document) -> bool {
        true
    }

    /// With a conversation template, send the description as a system turn.
    fn description_as_system(&self) -> bool {
        true
    }

    fn fewshot_examples<'a>(
        &'a self,
        doc: &Document,
        k: usize,
        prompt_mode: PromptMode,
        sampler: &mut Sampler,
    ) -> Result<Vec<&'a Document>> {
        default_fewshot_examples(self, doc, k, prompt_mode, sampler)
    }

    #[allow(clippy::too_many_arguments)]
    fn fewshot_context(
        &self,
        doc: &Document,
        num_fewshot: usize,
        prompt_mode: PromptMode,
        sampler: &mut Sampler,
        description: &str,
        style: PromptStyle,
    ) -> Result<Prompt> {
        default_fewshot_context(
            self,
            doc,
            num_fewshot,
            prompt_mode,
            sampler,
            description,
            style,
        )
    }

    fn construct_requests(&self, doc: &Document, ctx: &Prompt) -> Result<Vec<Request>>;

    /// Scores one document. `responses` are in the order of [`Task::construct_requests`].
    fn process_results(&self, doc: &Document, responses: &[Response]) -> Result<Metrics>;

    fn aggregation(&self) -> IndexMap<String, Aggregation>;

    fn higher_is_better(&self) -> IndexMap<String, bool>;

    fn stderr_enabled(&self, _metric: &str) -> bool {
        true
    }
}

/// Exemplar selection driven by the task's pool, manual list, index and exclusion rule.
pub fn default_fewshot_examples<'a, T: Task + ?Sized>(
    task: &'a T,
    doc: &Document,
    k: usize,
    prompt_mode: PromptMode,
    sampler: &mut Sampler,
) -> Result<Vec<&'a Document>> {
    if k == 0 {
        return Ok(vec![]);
    }
    let is_eligible = |candidate: &Document| task.is_eligible_exemplar(doc, candidate);
    let source = ExemplarSource {
        pool: match prompt_mode {
            PromptMode::Manual => &[],
            _ => task.fewshot_pool()?,
        },
        manual: match prompt_mode {
            PromptMode::Manual => task.manual_examples()?,
            _ => &[],
        },
        similarity: match prompt_mode {
            PromptMode::DynamicSimilar => task.similarity_index()?,
            _ => None,
        },
        searcher_k: task.searcher_k(),
        fixed_prefix: task.fixed_prefix(),
        is_eligible: &is_eligible,
    };
    Ok(source.select(doc, k, prompt_mode, sampler)?)
}

/// Selects exemplars, renders them with the task's templates and assembles the prompt.
#[allow(clippy::too_many_arguments)]
pub fn default_fewshot_context<T: Task + ?Sized>(
    task: &T,
    doc: &Document,
    num_fewshot: usize,
    prompt_mode: PromptMode,
    sampler: &mut Sampler,
    description: &str,
    style: PromptStyle,
) -> Result<Prompt> {
    let exemplars = task
        .fewshot_examples(doc, num_fewshot, prompt_mode, sampler)?
        .into_iter()
        .map(|exemplar| {
            Ok(RenderedExemplar {
                text: task.doc_to_text(exemplar)?,
                target: task.doc_to_target(exemplar)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let style = PromptStyle {
        description_as_system: task.description_as_system(),
        ..style
    };
    Ok(assemble(description, &exemplars, &task.doc_to_text(doc)?, style))
}
