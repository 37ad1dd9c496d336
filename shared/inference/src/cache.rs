use anyhow::{ensure, Context, Result};
use poeta_eval::{Backend, RequestArgs, RequestKind, Response};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_ROOT: &str = "lm_cache";

/// `<root>/<model>_<model_args>`, with the argument string made path-safe.
pub fn cache_dir(root: &Path, model: &str, model_args: &str) -> PathBuf {
    let args = model_args
        .replace('=', "-")
        .replace(',', "_")
        .replace('/', "-");
    root.join(format!("{model}_{args}"))
}

fn request_key(args: &RequestArgs) -> Result<String> {
    let serialized = serde_json::to_vec(args)?;
    Ok(format!("{:x}", Sha256::digest(serialized)))
}

/// Serves previously seen requests from disk and forwards only the rest to `inner`.
pub struct CachingBackend<B> {
    inner: B,
    dir: PathBuf,
    hits: usize,
    misses: usize,
}

impl<B: Backend> CachingBackend<B> {
    pub fn new(inner: B, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            inner,
            dir,
            hits: 0,
            misses: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn lookup(&self, key: &str) -> Option<Response> {
        let path = self.path(key);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    fn store(&self, key: &str, response: &Response) -> Result<()> {
        let path = self.path(key);
        fs::write(&path, serde_json::to_vec(response)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

impl<B: Backend> Backend for CachingBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute(&mut self, kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
        let keys = batch
            .iter()
            .map(|args| request_key(args))
            .collect::<Result<Vec<_>>>()?;
        let mut responses: Vec<Option<Response>> = keys.iter().map(|key| self.lookup(key)).collect();

        let missing: Vec<usize> = (0..batch.len())
            .filter(|&i| responses[i].is_none())
            .collect();
        self.hits += batch.len() - missing.len();
        self.misses += missing.len();
        debug!(
            %kind,
            hits = batch.len() - missing.len(),
            misses = missing.len(),
            "Cache lookup"
        );

        if !missing.is_empty() {
            let forwarded: Vec<&RequestArgs> = missing.iter().map(|&i| batch[i]).collect();
            let fresh = self.inner.execute(kind, &forwarded)?;
            ensure!(
                fresh.len() == forwarded.len(),
                "{} returned {} responses for {} uncached requests",
                self.inner.name(),
                fresh.len(),
                forwarded.len()
            );
            for (i, response) in missing.into_iter().zip(fresh) {
                self.store(&keys[i], &response)?;
                responses[i] = Some(response);
            }
        }

        Ok(responses.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poeta_eval::Prompt;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Counting {
        seen: Vec<usize>,
    }

    impl Backend for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&mut self, _kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
            self.seen.push(batch.len());
            Ok(batch
                .iter()
                .map(|args| Response::Text(format!("{}", args.input_len())))
                .collect())
        }
    }

    fn generation(prompt: &str) -> RequestArgs {
        RequestArgs::GreedyUntil {
            context: Prompt::text(prompt),
            until: vec!["\n".into()],
        }
    }

    #[test_log::test]
    fn only_misses_reach_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (generation("a"), generation("bb"), generation("ccc"));

        let mut cached = CachingBackend::new(Counting::default(), dir.path()).unwrap();
        let first = cached.execute(RequestKind::GreedyUntil, &[&a, &b]).unwrap();
        let second = cached
            .execute(RequestKind::GreedyUntil, &[&c, &b, &a])
            .unwrap();
        assert_eq!(first, vec![Response::Text("1".into()), Response::Text("2".into())]);
        assert_eq!(
            second,
            vec![
                Response::Text("3".into()),
                Response::Text("2".into()),
                Response::Text("1".into())
            ]
        );
        assert_eq!(cached.stats(), (2, 3));
        assert_eq!(cached.into_inner().seen, vec![2, 1]);

        // A fresh wrapper over the same directory starts warm.
        let mut reopened = CachingBackend::new(Counting::default(), dir.path()).unwrap();
        reopened.execute(RequestKind::GreedyUntil, &[&a, &b, &c]).unwrap();
        assert!(reopened.into_inner().seen.is_empty());
    }

    #[test]
    fn loglikelihood_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cached = CachingBackend::new(Counting::default(), dir.path()).unwrap();
        let args = generation("x");
        let key = request_key(&args).unwrap();
        let stored = Response::Loglikelihood {
            logprob: -0.75,
            is_greedy: true,
        };
        cached.store(&key, &stored).unwrap();
        assert_eq!(
            cached.execute(RequestKind::GreedyUntil, &[&args]).unwrap(),
            vec![stored]
        );
    }

    #[test]
    fn dir_name_is_path_safe() {
        let dir = cache_dir(Path::new("lm_cache"), "vllm", "engine=org/model,batch_size=8");
        assert_eq!(dir, Path::new("lm_cache/vllm_engine-org-model_batch_size-8"));
    }
}
