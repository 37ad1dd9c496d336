mod aggregator;
mod dataset;
mod dispatcher;
mod document;
mod fewshot;
mod harness;
mod metrics;
mod prompt;
mod report;
mod request;
mod router;
mod sample_log;
mod tasks;
mod traits;

pub use aggregator::{
    bootstrap_stderr, Aggregator, DEFAULT_BOOTSTRAP_ITERS, DEFAULT_BOOTSTRAP_SEED,
    EXPENSIVE_BOOTSTRAP_ITERS,
};
pub use dataset::{Dataset, Prepare, Split};
pub use dispatcher::{DispatchError, Dispatcher, Reorderer};
pub use document::{load_jsonl, Document};
pub use fewshot::{ExemplarSource, FewshotError, LexicalIndex, PromptMode, SimilarityIndex};
pub use harness::{
    check_integrity, eval_docs, evaluate, load_description_dict, simple_evaluate, EvalConfig,
    EvalState, HarnessError, StateTracker, DEFAULT_FEWSHOT_SEED,
};
pub use metrics::{
    macro_f1, mean, median, pearson, sample_stddev, weighted_f1, Aggregation, MetricSample, Metrics,
};
pub use prompt::{
    assemble, ChatMessage, ConversationTemplate, Prompt, PromptStyle, RenderedExemplar, Role,
    FEWSHOT_DELIMITER,
};
pub use report::{make_table, EvalResults, ModeResults, RunConfig};
pub use request::{Backend, Request, RequestArgs, RequestKind, Response, ResponseError};
pub use router::{BucketKey, RequestOrigin, ResultRouter, RouterError, ScoredSamples};
pub use sample_log::{format_record, SampleLog};
pub use tasks::{
    get_task_dict, task_from_name, AssinRte, AssinSts, BoolQPt, Enem, Scoring, TweetSentBr,
    ALL_TASKS, ALL_TASK_NAMES,
};
pub use traits::{default_fewshot_context, default_fewshot_examples, Task};
