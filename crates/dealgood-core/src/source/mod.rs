//! Request sources: where the request stream of an experiment comes from.
//!
//! A source is pulled by exactly one consumer, the dispatcher's pacing loop,
//! so implementations need not be shareable.

mod nginx;
mod random;
mod stream;

pub use nginx::LogReplaySource;
pub use random::{sample_requests, RandomSource};
pub use stream::{RequestDescriptor, StreamSource};

use crate::error::{ConfigError, SourceError};
use crate::request::Request;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

pub type NextRequest<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Request>, SourceError>> + Send + 'a>>;

/// Lazy, possibly infinite sequence of requests.
pub trait RequestSource: Send {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the source is exhausted, which ends a run normally.
    fn next_request(&mut self) -> NextRequest<'_>;
}

/// The closed set of built-in sources, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Random,
    NginxLog,
    Stdin,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "nginxlog" => Ok(Self::NginxLog),
            "-" | "stdin" => Ok(Self::Stdin),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("random"),
            Self::NginxLog => f.write_str("nginxlog"),
            Self::Stdin => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Source specific parameter, e.g. the log file path for `nginxlog`
    pub param: Option<String>,
    /// Seed for the random sampler
    pub seed: u64,
    /// Add a cache-busting query parameter to random samples
    pub jitter: bool,
}

/// Construct the source selected by `kind`.
pub async fn open_source(
    kind: SourceKind,
    options: &SourceOptions,
) -> Result<Box<dyn RequestSource>, ConfigError> {
    let param = options.param.as_deref().filter(|p| !p.is_empty());
    match kind {
        SourceKind::Random => Ok(Box::new(
            RandomSource::new(sample_requests(), options.seed).with_jitter(options.jitter),
        )),
        SourceKind::NginxLog => {
            let path = param.ok_or(ConfigError::MissingSourceParam("nginxlog"))?;
            Ok(Box::new(LogReplaySource::open(path).await?))
        }
        SourceKind::Stdin => Ok(Box::new(StreamSource::stdin())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_from_str() {
        assert_eq!("random".parse::<SourceKind>().unwrap(), SourceKind::Random);
        assert_eq!("nginxlog".parse::<SourceKind>().unwrap(), SourceKind::NginxLog);
        assert_eq!("-".parse::<SourceKind>().unwrap(), SourceKind::Stdin);
        assert!(matches!(
            "kafka".parse::<SourceKind>(),
            Err(ConfigError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn test_open_random() {
        let mut source = open_source(SourceKind::Random, &SourceOptions::default())
            .await
            .unwrap();
        assert_eq!(source.name(), "random");
        assert!(source.next_request().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nginxlog_requires_path() {
        let err = open_source(SourceKind::NginxLog, &SourceOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingSourceParam("nginxlog")));

        let options = SourceOptions {
            param: Some("/definitely/not/here.log".into()),
            ..Default::default()
        };
        let err = open_source(SourceKind::NginxLog, &options).await.err().unwrap();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
