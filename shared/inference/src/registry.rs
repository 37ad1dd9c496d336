use crate::{
    dummy::DummyBackend,
    error::BackendError,
    openai::{OpenAiBackend, OpenAiConfig, PROVIDERS},
};
use anyhow::Result;
use indexmap::IndexMap;
use poeta_eval::Backend;
use std::str::FromStr;
use tracing::warn;

pub const DUMMY: &str = "dummy";

const OPENAI_ARGS: [&str; 5] = ["engine", "base_url", "key_env_var", "batch_size", "max_gen_toks"];

pub type ModelArgs = IndexMap<String, String>;

/// Parses `key=value,key=value`. Empty segments are skipped.
pub fn parse_model_args(raw: &str) -> Result<ModelArgs, BackendError> {
    raw.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| BackendError::InvalidModelArg(segment.to_owned()))?;
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

fn parsed<T: FromStr>(args: &ModelArgs, key: &str) -> Result<Option<T>, BackendError>
where
    T::Err: std::fmt::Display,
{
    args.get(key)
        .map(|value| {
            value.parse().map_err(|err: T::Err| BackendError::BadModelArgValue {
                key: key.to_owned(),
                value: value.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

/// Builds the backend registered as `model`. `batch_size` is the default number of requests
/// in flight and is overridden by a `batch_size` model argument.
pub fn get_backend(
    model: &str,
    args: &ModelArgs,
    batch_size: Option<usize>,
) -> Result<Box<dyn Backend>> {
    if model == DUMMY {
        let mut backend = DummyBackend::new();
        if let Some(generation) = args.get("generation") {
            backend = backend.with_generation(generation.clone());
        }
        return Ok(Box::new(backend));
    }

    let Some(provider) = PROVIDERS.iter().find(|provider| provider.name == model) else {
        let available = std::iter::once(DUMMY)
            .chain(PROVIDERS.iter().map(|provider| provider.name))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(BackendError::UnknownModel {
            name: model.to_owned(),
            available,
        }
        .into());
    };

    for key in args.keys() {
        if !OPENAI_ARGS.contains(&key.as_str()) {
            warn!(model, arg = %key, "Ignoring unknown model argument");
        }
    }

    let engine = args
        .get("engine")
        .ok_or(BackendError::MissingModelArg("engine"))?;
    let mut config = OpenAiConfig::new(provider, engine.clone());
    if let Some(base_url) = args.get("base_url") {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(parallel) = parsed::<usize>(args, "batch_size")?.or(batch_size) {
        config = config.with_parallel_requests(parallel);
    }
    if let Some(max_gen_toks) = parsed::<usize>(args, "max_gen_toks")? {
        config = config.with_max_gen_toks(max_gen_toks);
    }

    let key_env_var = args
        .get("key_env_var")
        .map(String::as_str)
        .unwrap_or(provider.key_env_var);
    match std::env::var(key_env_var) {
        Ok(key) => config = config.with_api_key(key),
        Err(_) if !provider.needs_key => config = config.with_api_key("-"),
        Err(_) => return Err(BackendError::MissingApiKey(key_env_var.to_owned()).into()),
    }

    Ok(Box::new(OpenAiBackend::new(config)?))
}
