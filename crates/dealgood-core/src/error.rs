use std::path::PathBuf;

use thiserror::Error;

/// Invalid experiment definitions, detected before anything is dispatched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("experiment has no backends")]
    NoBackends,

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: u64 },

    #[error("invalid backend url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("duplicate backend name {0:?}")]
    DuplicateBackend(String),

    #[error("unknown backpressure policy {0:?}, expected 'drop' or 'wait'")]
    UnknownPolicy(String),

    #[error("unknown request source {0:?}, expected 'random', 'nginxlog' or '-'")]
    UnknownSource(String),

    #[error("source {0} requires a parameter")]
    MissingSourceParam(&'static str),

    #[error("read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Failure of a request source to produce its next request.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode entry on line {line}: {source}")]
    Decode {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid request on line {line}: {reason}")]
    InvalidRequest { line: u64, reason: String },
}

/// Fatal outcome of a run. Backend failures are never reported here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("experiment: {0}")]
    Config(#[from] ConfigError),

    #[error("request source: {0}")]
    Source(#[from] SourceError),

    #[error("build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("outcome for unknown backend {0:?}")]
    UnknownBackend(String),
}
