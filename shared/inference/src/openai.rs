use crate::error::BackendError;
use anyhow::{Context, Result};
use futures::{stream, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use poeta_eval::{Backend, ChatMessage, Prompt, RequestArgs, RequestKind, Response, Role};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_MAX_GEN_TOKS: usize = 1000;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
/// Engines that take `max_completion_tokens` and reject `temperature` / `stop`.
const REASONING_ENGINES: [&str; 3] = ["o1", "o3", "gpt-5"];

/// An OpenAI-compatible API endpoint known by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provider {
    pub name: &'static str,
    pub base_url: &'static str,
    pub key_env_var: &'static str,
    /// Local servers accept any key, so none has to be configured.
    pub needs_key: bool,
    pub supports_temperature_stop: bool,
}

impl Provider {
    const fn hosted(name: &'static str, base_url: &'static str, key_env_var: &'static str) -> Self {
        Self {
            name,
            base_url,
            key_env_var,
            needs_key: true,
            supports_temperature_stop: true,
        }
    }

    const fn local(name: &'static str, base_url: &'static str, key_env_var: &'static str) -> Self {
        Self {
            needs_key: false,
            ..Self::hosted(name, base_url, key_env_var)
        }
    }
}

pub const PROVIDERS: [Provider; 10] = [
    Provider::hosted("openai", "https://api.openai.com/v1", "OPENAI_API_SECRET_KEY"),
    Provider::hosted("chatgpt", "https://api.openai.com/v1", "OPENAI_API_SECRET_KEY"),
    Provider::hosted("maritalk", "https://chat.maritaca.ai/api", "MARITALK_API_SECRET_KEY"),
    Provider::hosted("deepseek", "https://api.deepseek.com", "DEEPSEEK_API_SECRET_KEY"),
    Provider::hosted("together", "https://api.together.xyz/v1", "TOGETHER_API_SECRET_KEY"),
    Provider::hosted(
        "fireworks",
        "https://api.fireworks.ai/inference/v1",
        "FIREWORKS_API_KEY",
    ),
    Provider::hosted(
        "deepinfra",
        "https://api.deepinfra.com/v1/openai",
        "DEEPINFRA_API_KEY",
    ),
    Provider::local("tgi", "http://localhost:8080/v1", "TGI_API_SECRET_KEY"),
    Provider::local("vllm", "http://localhost:8000/v1", "VLLM_API_SECRET_KEY"),
    Provider {
        supports_temperature_stop: false,
        ..Provider::hosted(
            "gemini",
            "https://generativelanguage.googleapis.com/v1beta/openai/",
            "GEMINI_API_KEY",
        )
    },
];

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub provider: &'static str,
    pub engine: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Requests in flight at once.
    pub parallel_requests: usize,
    pub max_gen_toks: usize,
    pub supports_temperature_stop: bool,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
}

impl OpenAiConfig {
    pub fn new(provider: &Provider, engine: impl Into<String>) -> Self {
        let engine = engine.into();
        let supports_temperature_stop =
            provider.supports_temperature_stop && !matches!(engine.as_str(), "o1" | "o3");
        Self {
            provider: provider.name,
            engine,
            base_url: provider.base_url.to_owned(),
            api_key: None,
            parallel_requests: 1,
            max_gen_toks: DEFAULT_MAX_GEN_TOKS,
            supports_temperature_stop,
            max_attempts: 5,
            initial_backoff: Duration::from_secs(3),
            backoff_factor: 1.5,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_parallel_requests(mut self, parallel_requests: usize) -> Self {
        self.parallel_requests = parallel_requests.max(1);
        self
    }

    pub fn with_max_gen_toks(mut self, max_gen_toks: usize) -> Self {
        self.max_gen_toks = max_gen_toks;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, factor: f64, max_attempts: u32) -> Self {
        self.initial_backoff = initial;
        self.backoff_factor = factor;
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn uses_completion_tokens(&self) -> bool {
        REASONING_ENGINES.contains(&self.engine.as_str())
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url.trim_end_matches('/'))
    }

    /// Body of a greedy generation call and the endpoint it goes to.
    pub fn generation_body(&self, context: &Prompt, until: &[String]) -> (&'static str, Value) {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.engine));
        let sends_stop = self.supports_temperature_stop && !self.uses_completion_tokens();
        if sends_stop {
            body.insert("temperature".into(), json!(0.0));
            body.insert("stop".into(), json!([]));
        }
        let max_tokens_key = if self.uses_completion_tokens() {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        body.insert(max_tokens_key.into(), json!(self.max_gen_toks));

        match context {
            Prompt::Chat(messages) => {
                body.insert("messages".into(), json!(strip_default_system(messages)));
                ("chat/completions", Value::Object(body))
            }
            Prompt::Text(text) => {
                body.insert("prompt".into(), json!(text));
                if sends_stop {
                    body.insert("stop".into(), json!(until));
                }
                ("completions", Value::Object(body))
            }
        }
    }

    /// Body that scores `text` by echoing it back with per-token log-probabilities.
    pub fn echo_body(&self, text: &str) -> Value {
        json!({
            "model": self.engine,
            "prompt": text,
            "max_tokens": 0,
            "echo": true,
            "logprobs": 1,
            "temperature": 0.0,
        })
    }
}

/// A leading default system turn is dropped; a custom one is kept.
fn strip_default_system(messages: &[ChatMessage]) -> &[ChatMessage] {
    match messages.split_first() {
        Some((first, rest))
            if first.role == Role::System && first.content == DEFAULT_SYSTEM_PROMPT =>
        {
            rest
        }
        _ => messages,
    }
}

#[derive(Deserialize, Debug)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<ChatReply>,
    #[serde(default)]
    logprobs: Option<TokenLogprobs>,
}

#[derive(Deserialize, Debug)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TokenLogprobs {
    tokens: Vec<String>,
    token_logprobs: Vec<Option<f64>>,
    #[serde(default)]
    top_logprobs: Option<Vec<Option<IndexMap<String, f64>>>>,
    text_offset: Vec<usize>,
}

impl TokenLogprobs {
    /// Summed log-probability of the tokens starting at or after character `start`, and
    /// whether each of them was also the most likely token.
    fn continuation(&self, start: usize) -> Result<(f64, bool), String> {
        let first = self
            .text_offset
            .iter()
            .position(|&offset| offset >= start)
            .ok_or_else(|| "continuation produced no tokens".to_string())?;
        let mut logprob = 0.0;
        let mut is_greedy = true;
        for i in first..self.tokens.len() {
            logprob += self
                .token_logprobs
                .get(i)
                .copied()
                .flatten()
                .ok_or_else(|| format!("token {i} has no logprob"))?;
            let top = self
                .top_logprobs
                .as_ref()
                .and_then(|top| top.get(i))
                .and_then(Option::as_ref);
            let best = top.and_then(|top| {
                top.iter()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(token, _)| token)
            });
            if best != Some(&self.tokens[i]) {
                is_greedy = false;
            }
        }
        Ok((logprob, is_greedy))
    }

    /// Sum over every token that has a logprob; the first echoed token never does.
    fn total(&self) -> f64 {
        self.token_logprobs.iter().flatten().sum()
    }
}

enum Decode {
    Text,
    Continuation { context_chars: usize },
    Rolling,
}

struct Call {
    endpoint: &'static str,
    body: Value,
    decode: Decode,
}

pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;
        info!(
            provider = config.provider,
            engine = %config.engine,
            base_url = %config.base_url,
            parallel_requests = config.parallel_requests,
            "Initialized OpenAI-compatible backend"
        );
        Ok(Self {
            config,
            client,
            runtime,
        })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn call(&self, args: &RequestArgs) -> Result<Call, BackendError> {
        match args {
            RequestArgs::GreedyUntil { context, until } => {
                let (endpoint, body) = self.config.generation_body(context, until);
                Ok(Call {
                    endpoint,
                    body,
                    decode: Decode::Text,
                })
            }
            RequestArgs::Loglikelihood {
                context: Prompt::Text(context),
                continuation,
            } => Ok(Call {
                endpoint: "completions",
                body: self.config.echo_body(&format!("{context}{continuation}")),
                decode: Decode::Continuation {
                    context_chars: context.chars().count(),
                },
            }),
            RequestArgs::Loglikelihood {
                context: Prompt::Chat(_),
                ..
            } => Err(BackendError::Unsupported {
                backend: self.config.provider.to_owned(),
                kind: RequestKind::Loglikelihood,
                detail: " with conversation prompts",
            }),
            RequestArgs::LoglikelihoodRolling { text } => Ok(Call {
                endpoint: "completions",
                body: self.config.echo_body(text),
                decode: Decode::Rolling,
            }),
        }
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T, BackendError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status,
                url: url.to_owned(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn post_with_retry<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> Result<T, BackendError> {
        let url = self.config.url(endpoint);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.post(&url, body).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt >= self.config.max_attempts => {
                    return Err(BackendError::RetriesExhausted {
                        url,
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(%url, attempt, error = %err, "Request failed, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f64(self.config.backoff_factor);
                    attempt += 1;
                }
            }
        }
    }

    async fn run(&self, call: Call) -> Result<Response, BackendError> {
        let url = self.config.url(call.endpoint);
        let response: CompletionResponse = self.post_with_retry(call.endpoint, &call.body).await?;
        let decode_error = |reason: String| BackendError::Decode {
            url: url.clone(),
            reason,
        };
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| decode_error("no choices".into()))?;

        match call.decode {
            Decode::Text => {
                let text = choice
                    .message
                    .and_then(|message| message.content)
                    .or(choice.text);
                Ok(Response::Text(text.unwrap_or_else(|| {
                    warn!(%url, "Model returned an empty response, scoring it as an empty string");
                    String::new()
                })))
            }
            Decode::Continuation { context_chars } => {
                let logprobs = choice
                    .logprobs
                    .ok_or_else(|| decode_error("no logprobs".into()))?;
                let (logprob, is_greedy) =
                    logprobs.continuation(context_chars).map_err(decode_error)?;
                Ok(Response::Loglikelihood { logprob, is_greedy })
            }
            Decode::Rolling => {
                let logprobs = choice
                    .logprobs
                    .ok_or_else(|| decode_error("no logprobs".into()))?;
                Ok(Response::Score(logprobs.total()))
            }
        }
    }
}

impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        self.config.provider
    }

    fn execute(&mut self, kind: RequestKind, batch: &[&RequestArgs]) -> Result<Vec<Response>> {
        let calls = batch
            .iter()
            .map(|args| self.call(args))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(%kind, size = calls.len(), "Sending batch");
        let this = &*self;
        let responses = this.runtime.block_on(
            stream::iter(calls)
                .map(|call| this.run(call))
                .buffered(this.config.parallel_requests.max(1))
                .try_collect::<Vec<_>>(),
        )?;
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider(name: &str) -> &'static Provider {
        PROVIDERS.iter().find(|p| p.name == name).unwrap()
    }

    fn logprobs(json: Value) -> TokenLogprobs {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn text_prompts_go_to_completions_with_stop() {
        let config = OpenAiConfig::new(provider("vllm"), "sabia").with_max_gen_toks(32);
        let (endpoint, body) = config.generation_body(&Prompt::text("Resposta:"), &["\n".into()]);
        assert_eq!(endpoint, "completions");
        assert_eq!(
            body,
            json!({
                "model": "sabia",
                "temperature": 0.0,
                "stop": ["\n"],
                "max_tokens": 32,
                "prompt": "Resposta:",
            })
        );
    }

    #[test]
    fn chat_prompts_drop_only_the_default_system_turn() {
        let config = OpenAiConfig::new(provider("openai"), "gpt-4o");
        let default = Prompt::Chat(vec![
            ChatMessage::new(Role::System, DEFAULT_SYSTEM_PROMPT),
            ChatMessage::new(Role::User, "Oi"),
        ]);
        let (endpoint, body) = config.generation_body(&default, &["\n".into()]);
        assert_eq!(endpoint, "chat/completions");
        assert_eq!(body["messages"], json!([{ "role": "user", "content": "Oi" }]));
        assert_eq!(body["stop"], json!([]));

        let custom = Prompt::Chat(vec![
            ChatMessage::new(Role::System, "Responda em português."),
            ChatMessage::new(Role::User, "Oi"),
        ]);
        let (_, body) = config.generation_body(&custom, &[]);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn reasoning_engines_use_completion_token_budget() {
        let config = OpenAiConfig::new(provider("openai"), "o3");
        let (_, body) = config.generation_body(&Prompt::text("x"), &["\n".into()]);
        assert_eq!(
            body,
            json!({ "model": "o3", "max_completion_tokens": 1000, "prompt": "x" })
        );

        let gemini = OpenAiConfig::new(provider("gemini"), "gemini-2.0-flash");
        assert!(!gemini.supports_temperature_stop);
        assert_eq!(
            gemini.url("chat/completions"),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn continuation_logprob_starts_at_context_end() {
        let logprobs = logprobs(json!({
            "tokens": ["Pergunta", ":", " sim", "!"],
            "token_logprobs": [null, -0.5, -1.25, -0.25],
            "top_logprobs": [null, { ":": -0.5 }, { " sim": -1.25, " não": -2.0 }, { "!": -0.25 }],
            "text_offset": [0, 8, 9, 13],
        }));
        assert_eq!(logprobs.continuation(9), Ok((-1.5, true)));
        assert_eq!(logprobs.total(), -2.0);
    }

    #[test]
    fn continuation_is_not_greedy_when_another_token_wins() {
        let logprobs = logprobs(json!({
            "tokens": ["a", " não"],
            "token_logprobs": [null, -2.0],
            "top_logprobs": [null, { " sim": -0.1 }],
            "text_offset": [0, 1],
        }));
        assert_eq!(logprobs.continuation(1), Ok((-2.0, false)));
        assert!(logprobs.continuation(5).is_err());
    }

    #[test]
    fn conversation_loglikelihood_is_unsupported() {
        let backend = OpenAiBackend::new(OpenAiConfig::new(provider("tgi"), "m")).unwrap();
        let args = RequestArgs::Loglikelihood {
            context: Prompt::Chat(vec![ChatMessage::new(Role::User, "Oi")]),
            continuation: " sim".into(),
        };
        assert!(matches!(
            backend.call(&args),
            Err(BackendError::Unsupported {
                kind: RequestKind::Loglikelihood,
                ..
            })
        ));
    }
}
