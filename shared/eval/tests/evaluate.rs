use anyhow::Result;
use indexmap::IndexMap;
use poeta_eval::{
    check_integrity, doc, evaluate, make_table, Aggregation, Backend, BoolQPt, Dataset,
    DispatchError, Document, EvalConfig, MetricSample, Metrics, Prompt, PromptMode, Request,
    RequestArgs, RequestKind, Response, Scoring, Split, Task,
};
use pretty_assertions::assert_eq;
use std::{
    fmt::Display,
    fs,
    sync::{Arc, Mutex},
};

fn boolq(scoring: Scoring) -> Box<dyn Task> {
    let train = (0..10)
        .map(|i| {
            doc!({
                "question": format!("pergunta {i}"),
                "passage": format!("contexto {i}"),
                "answer": i % 2 == 0
            })
        })
        .collect();
    let validation = (0..6)
        .map(|i| {
            doc!({
                "question": format!("alvo {i}"),
                "passage": format!("contexto alvo {i}"),
                "answer": i < 3
            })
        })
        .collect();
    let dataset = Dataset::in_memory("boolq_pt")
        .with_split(Split::Train, train)
        .with_split(Split::Validation, validation);
    Box::new(BoolQPt::from_dataset(dataset, scoring))
}

/// Always prefers " sim" and always generates " sim".
#[derive(Default)]
struct AlwaysYes {
    calls: Vec<(RequestKind, usize)>,
}

impl Backend for AlwaysYes {
    fn name(&self) -> &str {
        "always-yes"
    }

    fn execute(&mut self, kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
        self.calls.push((kind, batch.len()));
        Ok(batch
            .iter()
            .map(|args| match args {
                RequestArgs::Loglikelihood { continuation, .. } => Response::Loglikelihood {
                    logprob: if continuation == " sim" { -0.1 } else { -3.0 },
                    is_greedy: continuation == " sim",
                },
                RequestArgs::GreedyUntil { .. } => Response::Text(" sim".into()),
                RequestArgs::LoglikelihoodRolling { .. } => Response::Score(-1.0),
            })
            .collect())
    }
}

fn config() -> EvalConfig {
    EvalConfig {
        num_fewshot: 2,
        prompt_modes: vec![PromptMode::Fixed, PromptMode::DynamicRandom],
        bootstrap_iters: 200,
        ..EvalConfig::default()
    }
}

#[test_log::test]
fn evaluates_every_task_and_mode() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("boolq_pt_greedy_fixed_samples.txt");
    fs::write(&stale, "left over from an earlier run\n").unwrap();

    let tasks = IndexMap::from([
        ("boolq_pt".to_string(), boolq(Scoring::Loglikelihood)),
        ("boolq_pt_greedy".to_string(), boolq(Scoring::Greedy)),
    ]);
    let config = EvalConfig {
        output_dir: Some(dir.path().to_owned()),
        ..config()
    };
    let mut backend = AlwaysYes::default();
    let results = evaluate(&tasks, &mut backend, &config).unwrap();

    assert_eq!(
        results.results.keys().collect::<Vec<_>>(),
        vec!["boolq_pt", "boolq_pt_greedy"]
    );
    for modes in results.results.values() {
        assert_eq!(
            modes.keys().collect::<Vec<_>>(),
            vec!["fixed", "dynamic-random"]
        );
        for mode in modes.values() {
            assert_eq!(mode.num_examples, 6);
            assert_eq!(mode.metrics["acc"], 0.5);
            assert!(mode.metrics["acc_stderr"] > 0.0);
        }
    }
    assert_eq!(results.versions["boolq_pt"], 0);

    // One loglikelihood call covering both prompt modes, one generation call.
    assert_eq!(
        backend.calls,
        vec![
            (RequestKind::Loglikelihood, 2 * 2 * 6),
            (RequestKind::GreedyUntil, 2 * 6)
        ]
    );

    let log = fs::read_to_string(&stale).unwrap();
    assert!(!log.contains("left over"));
    assert_eq!(log.matches("doc_id: ").count(), 6);
    assert!(log.contains("Resposta:"));
    assert!(!dir.path().join("boolq_pt_fixed_samples.txt").exists());

    let table = make_table(&results);
    assert!(table.contains("|boolq_pt_greedy|"));
    assert!(table.contains("dynamic-random"));
}

#[test_log::test]
fn limit_and_seed_make_runs_repeatable() {
    let tasks = IndexMap::from([("boolq_pt".to_string(), boolq(Scoring::Loglikelihood))]);
    let config = EvalConfig {
        limit: Some(4),
        ..config()
    };
    let first = evaluate(&tasks, &mut AlwaysYes::default(), &config).unwrap();
    let second = evaluate(&tasks, &mut AlwaysYes::default(), &config).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.results["boolq_pt"]["fixed"].num_examples, 4);
}

#[test_log::test]
fn integrity_check_passes_for_builtin_task() {
    let task = boolq(Scoring::Greedy);
    check_integrity(task.as_ref(), "boolq_pt_greedy", &config()).unwrap();
}

/// Builds one loglikelihood and one generation request per document and records, at
/// scoring time, which responses it was given.
struct TwoKinds {
    docs: Vec<Document>,
    scored: Arc<Mutex<Vec<Vec<Response>>>>,
}

impl Display for TwoKinds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "two_kinds")
    }
}

impl Task for TwoKinds {
    fn has_training_docs(&self) -> bool {
        false
    }
    fn has_validation_docs(&self) -> bool {
        false
    }
    fn has_test_docs(&self) -> bool {
        true
    }
    fn test_docs(&self) -> Result<&[Document]> {
        Ok(&self.docs)
    }
    fn doc_to_text(&self, doc: &Document) -> Result<String> {
        Ok(doc.get_str("text")?.to_owned())
    }
    fn doc_to_target(&self, _doc: &Document) -> Result<String> {
        Ok(String::new())
    }
    fn construct_requests(&self, _doc: &Document, ctx: &Prompt) -> Result<Vec<Request>> {
        Ok(vec![
            Request::greedy_until(ctx, ["\n"]),
            Request::loglikelihood(ctx, " sim"),
        ])
    }
    fn process_results(&self, _doc: &Document, responses: &[Response]) -> Result<Metrics> {
        self.scored.lock().unwrap().push(responses.to_vec());
        Ok(Metrics::from([("n".to_string(), MetricSample::Scalar(1.0))]))
    }
    fn aggregation(&self) -> IndexMap<String, Aggregation> {
        IndexMap::from([("n".to_string(), Aggregation::Sum)])
    }
    fn higher_is_better(&self) -> IndexMap<String, bool> {
        IndexMap::from([("n".to_string(), true)])
    }
}

#[test_log::test]
fn documents_are_scored_once_after_all_kinds_return() {
    let scored = Arc::new(Mutex::new(Vec::new()));
    let task = TwoKinds {
        docs: (0..3).map(|i| doc!({ "text": format!("doc {i}") })).collect(),
        scored: scored.clone(),
    };
    let tasks = IndexMap::from([("two_kinds".to_string(), Box::new(task) as Box<dyn Task>)]);
    let config = EvalConfig {
        prompt_modes: vec![PromptMode::Fixed],
        bootstrap_iters: 0,
        ..EvalConfig::default()
    };
    let results = evaluate(&tasks, &mut AlwaysYes::default(), &config).unwrap();
    assert_eq!(results.results["two_kinds"]["fixed"].metrics["n"], 3.0);

    let scored = scored.lock().unwrap();
    assert_eq!(scored.len(), 3);
    for responses in scored.iter() {
        assert_eq!(
            responses,
            &vec![
                Response::Text(" sim".into()),
                Response::Loglikelihood {
                    logprob: -0.1,
                    is_greedy: true
                }
            ]
        );
    }
}

/// Loses one response per batch.
struct Lossy;

impl Backend for Lossy {
    fn name(&self) -> &str {
        "lossy"
    }

    fn execute(&mut self, _kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
        Ok(vec![Response::Text(String::new()); batch.len().saturating_sub(1)])
    }
}

#[test_log::test]
fn batch_mismatch_aborts_the_run() {
    let tasks = IndexMap::from([("boolq_pt_greedy".to_string(), boolq(Scoring::Greedy))]);
    let err = evaluate(&tasks, &mut Lossy, &config()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DispatchError>(),
        Some(DispatchError::BatchSizeMismatch { got: 11, expected: 12, .. })
    ));
}
