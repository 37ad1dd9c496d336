use poeta_eval::RequestKind;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unknown model {name:?}, available: {available}")]
    UnknownModel { name: String, available: String },

    #[error("invalid model argument {0:?}, expected key=value")]
    InvalidModelArg(String),

    #[error("model argument {key}={value:?}: {reason}")]
    BadModelArgValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("model argument {0} is required")]
    MissingModelArg(&'static str),

    #[error("environment variable {0} not found")]
    MissingApiKey(String),

    #[error("{backend} does not support {kind} requests{detail}")]
    Unsupported {
        backend: String,
        kind: RequestKind,
        detail: &'static str,
    },

    #[error("HTTP {status} from {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },

    #[error("malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("no response from {url} after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<BackendError>,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
