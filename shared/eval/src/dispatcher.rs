use crate::request::{Backend, Request, RequestArgs, RequestKind, Response, ResponseError};
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::cmp::Reverse;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("backend returned {got} responses for a {kind} batch of {expected}")]
    BatchSizeMismatch {
        kind: RequestKind,
        expected: usize,
        got: usize,
    },

    #[error("request {position}: {source}")]
    ResponseIndex {
        position: usize,
        #[source]
        source: ResponseError,
    },

    #[error("{kind} dispatch received a {found} request at position {position}")]
    MixedKinds {
        kind: RequestKind,
        found: RequestKind,
        position: usize,
    },
}

/// A stable permutation and its inverse.
#[derive(Debug, Clone)]
pub struct Reorderer {
    /// `order[j]` is the original position of the `j`-th reordered item.
    order: Vec<usize>,
}

impl Reorderer {
    pub fn new<T, K: Ord>(items: &[T], key: impl Fn(&T) -> K) -> Self {
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by_cached_key(|&i| key(&items[i]));
        Self { order }
    }

    pub fn reordered<'a, T>(&self, items: &'a [T]) -> Vec<&'a T> {
        self.order.iter().map(|&i| &items[i]).collect()
    }

    /// Puts results computed in reordered order back into original order.
    pub fn restore<R>(&self, results: Vec<R>) -> Vec<R> {
        let mut slots: Vec<Option<R>> = (0..self.order.len()).map(|_| None).collect();
        for (result, &original) in results.into_iter().zip(&self.order) {
            slots[original] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }
}

/// Splits reordered requests into backend calls: contiguous runs sharing a grouping key,
/// each capped at `batch_size`.
fn batches<'a>(
    requests: &[&'a RequestArgs],
    batch_size: Option<usize>,
) -> Vec<Vec<&'a RequestArgs>> {
    let mut out: Vec<Vec<&RequestArgs>> = Vec::new();
    for &args in requests {
        let fits = out.last().is_some_and(|batch| {
            batch[0].grouping_key() == args.grouping_key()
                && batch_size.map_or(true, |size| batch.len() < size)
        });
        match out.last_mut() {
            Some(batch) if fits => batch.push(args),
            _ => out.push(vec![args]),
        }
    }
    out
}

/// Executes all requests of one kind against a backend, in batches.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    /// Maximum requests per backend call; `None` sends each grouping-key run whole.
    pub batch_size: Option<usize>,
    pub progress_bar: bool,
}

impl Dispatcher {
    pub fn new(batch_size: Option<usize>, progress_bar: bool) -> Self {
        Self {
            batch_size: batch_size.filter(|size| *size > 0),
            progress_bar,
        }
    }

    /// Responses in the order of `requests`, with each request's `index` applied.
    pub fn run(
        &self,
        backend: &mut dyn Backend,
        kind: RequestKind,
        requests: &[&Request],
    ) -> Result<Vec<Response>> {
        if let Some((position, request)) = requests
            .iter()
            .enumerate()
            .find(|(_, request)| request.kind() != kind)
        {
            return Err(DispatchError::MixedKinds {
                kind,
                found: request.kind(),
                position,
            }
            .into());
        }

        let args: Vec<&RequestArgs> = requests.iter().map(|r| &r.args).collect();
        let reorderer = Reorderer::new(&args, |a| {
            (a.grouping_key().to_vec(), Reverse(a.input_len()))
        });
        let reordered: Vec<&RequestArgs> = reorderer.reordered(&args).into_iter().copied().collect();
        let batches = batches(&reordered, self.batch_size);

        info!(
            backend = backend.name(),
            %kind,
            requests = requests.len(),
            batches = batches.len(),
            "Dispatching requests"
        );
        let progress = self.progress(requests.len() as u64, kind);

        let mut responses = Vec::with_capacity(requests.len());
        for batch in batches {
            let got = backend.execute(kind, &batch)?;
            if got.len() != batch.len() {
                return Err(DispatchError::BatchSizeMismatch {
                    kind,
                    expected: batch.len(),
                    got: got.len(),
                }
                .into());
            }
            debug!(%kind, size = batch.len(), "Batch done");
            if let Some(progress) = &progress {
                progress.inc(batch.len() as u64);
            }
            responses.extend(got);
        }
        if let Some(progress) = progress {
            progress.finish_and_clear();
        }

        reorderer
            .restore(responses)
            .into_iter()
            .zip(requests)
            .enumerate()
            .map(|(position, (response, request))| match request.index {
                Some(index) => response
                    .select(index)
                    .map_err(|source| {
                        anyhow::Error::from(DispatchError::ResponseIndex { position, source })
                    }),
                None => Ok(response),
            })
            .collect()
    }

    fn progress(&self, len: u64, kind: RequestKind) -> Option<ProgressBar> {
        if !self.progress_bar {
            return None;
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(kind.to_string());
        Some(bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Prompt;
    use pretty_assertions::assert_eq;

    /// Returns each request's args as its response text.
    struct Echo {
        calls: Vec<usize>,
    }

    impl Backend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn execute(&mut self, _kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
            self.calls.push(batch.len());
            Ok(batch
                .iter()
                .map(|args| Response::Text(serde_json::to_string(args).unwrap()))
                .collect())
        }
    }

    fn greedy(ctx: &str, until: &str) -> Request {
        Request::greedy_until(&Prompt::text(ctx), [until])
    }

    #[test]
    fn reorderer_restores_original_order() {
        let items = vec![3, 1, 2, 1];
        let reorderer = Reorderer::new(&items, |x| *x);
        let sorted: Vec<i32> = reorderer.reordered(&items).into_iter().copied().collect();
        assert_eq!(sorted, vec![1, 1, 2, 3]);
        assert_eq!(reorderer.restore(sorted), items);
    }

    #[test]
    fn batches_split_on_grouping_key_and_size() {
        let requests = [
            greedy("aaaa", "\n"),
            greedy("b", "\n"),
            greedy("cc", "."),
            greedy("ddd", "\n"),
        ];
        let args: Vec<&RequestArgs> = requests.iter().map(|r| &r.args).collect();
        let sizes: Vec<usize> = batches(&args, Some(2)).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        let sizes: Vec<usize> = batches(&args, None).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    #[test]
    fn groups_by_until_before_calling_backend() {
        let requests = [
            greedy("a", "\n"),
            greedy("bb", "."),
            greedy("ccc", "\n"),
        ];
        let refs: Vec<&Request> = requests.iter().collect();
        let mut backend = Echo { calls: vec![] };
        Dispatcher::new(None, false)
            .run(&mut backend, RequestKind::GreedyUntil, &refs)
            .unwrap();
        assert_eq!(backend.calls.len(), 2);
        assert_eq!(backend.calls.iter().sum::<usize>(), 3);
    }

    #[test]
    fn rejects_mixed_kinds() {
        let ctx = Prompt::text("x");
        let requests = [Request::loglikelihood(&ctx, " a"), greedy("x", "\n")];
        let refs: Vec<&Request> = requests.iter().collect();
        let err = Dispatcher::default()
            .run(&mut Echo { calls: vec![] }, RequestKind::Loglikelihood, &refs)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::MixedKinds { position: 1, .. })
        ));
    }
}
