use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a call never produced an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

/// Closed classification of a single backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum OutcomeClass {
    /// 2xx or 3xx
    Success { status: u16 },
    /// 4xx or 5xx
    HttpError { status: u16 },
    Transport { kind: TransportErrorKind },
    Cancelled,
}

impl OutcomeClass {
    pub fn from_status(status: u16) -> Self {
        if status >= 400 {
            Self::HttpError { status }
        } else {
            Self::Success { status }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Success { status } | Self::HttpError { status } => Some(*status),
            Self::Transport { .. } | Self::Cancelled => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::HttpError { .. } => "http_error",
            Self::Transport {
                kind: TransportErrorKind::Timeout,
            } => "timeout",
            Self::Transport {
                kind: TransportErrorKind::Connect,
            } => "connect_error",
            Self::Transport {
                kind: TransportErrorKind::Other,
            } => "transport_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{} {}", self.label(), status),
            None => f.write_str(self.label()),
        }
    }
}

/// Recorded result of one request sent to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub backend: Arc<str>,
    pub method: Arc<str>,
    /// Path and query as sent
    pub uri: Arc<str>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_micros")]
    pub latency: Duration,
    pub class: OutcomeClass,
    /// Body size, when the body was read to the end
    pub bytes: Option<u64>,
}

impl Outcome {
    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}
