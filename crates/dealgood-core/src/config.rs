use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

const DEFAULT_TIMEOUT_SECS: i64 = 10;

/// Experiment definition as read from a file or assembled from flags.
///
/// Numeric fields are signed so that negative values surface as validation
/// errors rather than parse errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub backends: Vec<BackendConfig>,
    /// Requests per second
    pub rate: i64,
    /// Maximum requests in flight
    pub concurrency: i64,
    /// Run length in seconds
    pub duration: i64,
    /// Per-call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// Host header used for backends that do not force their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Display name; defaults to the base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "baseURL", alias = "base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: None,
            base_url: base_url.into(),
            host: None,
        }
    }
}

/// What the pacing loop does with a request when every concurrency slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Skip the request; effective rate drops under overload.
    #[default]
    Drop,
    /// Wait for a slot; rate is kept at the cost of delivery jitter.
    Wait,
}

impl FromStr for BackpressurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "wait" => Ok(Self::Wait),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Wait => f.write_str("wait"),
        }
    }
}

impl ExperimentConfig {
    /// Ad-hoc experiment against `targets` with the given pacing parameters.
    pub fn adhoc(
        name: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<String>>,
        rate: i64,
        concurrency: i64,
        duration: i64,
    ) -> Self {
        Self {
            name: name.into(),
            backends: targets.into_iter().map(BackendConfig::new).collect(),
            rate,
            concurrency,
            duration,
            timeout: None,
            host: None,
            backpressure: BackpressurePolicy::default(),
        }
    }

    /// Load from a JSON file, or TOML when the extension is `.toml`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let parsed = if is_toml {
            toml::from_str(&contents).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&contents).map_err(|e| e.to_string())
        };

        parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Check every invariant and produce the immutable run configuration.
    pub fn validate(&self) -> Result<Experiment, ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let rate = positive("rate", self.rate)?;
        let concurrency = positive("concurrency", self.concurrency)?;
        if concurrency > Semaphore::MAX_PERMITS as u64 {
            return Err(ConfigError::TooLarge {
                field: "concurrency",
                max: Semaphore::MAX_PERMITS as u64,
            });
        }
        let duration = positive("duration", self.duration)?;
        let timeout = positive("timeout", self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))?;

        let host = self.host.clone().filter(|h| !h.is_empty());
        let mut seen = HashSet::new();
        let mut backends = Vec::with_capacity(self.backends.len());

        for be in &self.backends {
            let base_url = parse_base_url(&be.base_url)?;
            let name = be.name.clone().unwrap_or_else(|| be.base_url.clone());
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateBackend(name));
            }
            backends.push(Backend {
                name,
                base_url,
                host: be.host.clone().filter(|h| !h.is_empty()).or_else(|| host.clone()),
            });
        }

        Ok(Experiment {
            name: self.name.clone(),
            backends,
            rate,
            concurrency: concurrency as usize,
            duration: Duration::from_secs(duration),
            timeout: Duration::from_secs(timeout),
            backpressure: self.backpressure,
        })
    }
}

fn positive(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    if value > 0 {
        Ok(value as u64)
    } else {
        Err(ConfigError::NotPositive { field })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("must not include query or fragment"));
    }
    Ok(url)
}

/// A validated HTTP target. The host has already been resolved against the
/// experiment-wide override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub base_url: Url,
    pub host: Option<String>,
}

impl Backend {
    pub fn new(name: impl Into<String>, base_url: Url) -> Self {
        Self {
            name: name.into(),
            base_url,
            host: None,
        }
    }
}

/// Validated, read-only configuration of one run.
#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    backends: Vec<Backend>,
    rate: u64,
    concurrency: usize,
    duration: Duration,
    timeout: Duration,
    backpressure: BackpressurePolicy,
}

impl Experiment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backpressure(&self) -> BackpressurePolicy {
        self.backpressure
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }
}
