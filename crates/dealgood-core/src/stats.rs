use crate::config::Backend;
use crate::error::StatsError;
use crate::outcome::{Outcome, OutcomeClass, TransportErrorKind};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Latencies above this are clamped into the top bucket.
const MAX_LATENCY_MICROS: u64 = 3_600_000_000;
const HISTOGRAM_SIGFIG: u8 = 3;
const OBSERVER_CAPACITY: usize = 4096;

/// Concurrent accumulator of outcomes, keyed by the fixed set of backends of a run.
///
/// Every mutation goes through [`StatsAggregator::record`] under one short
/// critical section; readers get owned copies via [`StatsAggregator::snapshot`].
pub struct StatsAggregator {
    index: HashMap<Arc<str>, usize>,
    inner: Mutex<Inner>,
    observers: broadcast::Sender<Outcome>,
    start_time: Instant,
}

struct Inner {
    seq: u64,
    dispatched: u64,
    dropped: u64,
    backends: Vec<BackendCounters>,
}

struct BackendCounters {
    name: Arc<str>,
    total: u64,
    success: u64,
    http_errors: u64,
    transport_errors: u64,
    timeouts: u64,
    cancelled: u64,
    bytes: u64,
    status_counts: BTreeMap<u16, u64>,
    latency: Histogram<u64>,
}

impl BackendCounters {
    fn new(name: Arc<str>) -> Self {
        let latency = Histogram::new_with_bounds(1, MAX_LATENCY_MICROS, HISTOGRAM_SIGFIG)
            .expect("latency histogram bounds are constant and valid");
        Self {
            name,
            total: 0,
            success: 0,
            http_errors: 0,
            transport_errors: 0,
            timeouts: 0,
            cancelled: 0,
            bytes: 0,
            status_counts: BTreeMap::new(),
            latency,
        }
    }

    fn apply(&mut self, outcome: &Outcome) {
        self.total += 1;
        match outcome.class {
            OutcomeClass::Success { .. } => self.success += 1,
            OutcomeClass::HttpError { .. } => self.http_errors += 1,
            OutcomeClass::Transport { kind } => {
                self.transport_errors += 1;
                if kind == TransportErrorKind::Timeout {
                    self.timeouts += 1;
                }
            }
            OutcomeClass::Cancelled => self.cancelled += 1,
        }

        // Only calls that got a response say anything about backend latency.
        if let Some(status) = outcome.class.status() {
            *self.status_counts.entry(status).or_insert(0) += 1;
            let micros = (outcome.latency.as_micros() as u64).max(1);
            self.latency.saturating_record(micros);
        }
        if let Some(bytes) = outcome.bytes {
            self.bytes += bytes;
        }
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            name: self.name.to_string(),
            total: self.total,
            success: self.success,
            http_errors: self.http_errors,
            transport_errors: self.transport_errors,
            timeouts: self.timeouts,
            cancelled: self.cancelled,
            bytes: self.bytes,
            status_counts: self.status_counts.clone(),
            latency: LatencySummary::from_histogram(&self.latency),
        }
    }
}

impl StatsAggregator {
    pub fn new(backends: &[Backend]) -> Self {
        let mut index = HashMap::with_capacity(backends.len());
        let mut counters = Vec::with_capacity(backends.len());
        for (idx, be) in backends.iter().enumerate() {
            let name: Arc<str> = Arc::from(be.name.as_str());
            index.insert(name.clone(), idx);
            counters.push(BackendCounters::new(name));
        }
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);

        Self {
            index,
            inner: Mutex::new(Inner {
                seq: 0,
                dispatched: 0,
                dropped: 0,
                backends: counters,
            }),
            observers,
            start_time: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one outcome. Only outcomes for a backend outside the run's
    /// keyspace are rejected.
    pub fn record(&self, outcome: Outcome) -> Result<(), StatsError> {
        let idx = *self
            .index
            .get(&outcome.backend)
            .ok_or_else(|| StatsError::UnknownBackend(outcome.backend.to_string()))?;

        self.lock().backends[idx].apply(&outcome);

        // Observers that lag lose messages; recording never waits for them.
        let _ = self.observers.send(outcome);
        Ok(())
    }

    /// A request passed backpressure and was fanned out to every backend.
    pub fn record_dispatched(&self) {
        self.lock().dispatched += 1;
    }

    /// A tick was spent without dispatching its request.
    pub fn record_dropped(&self) {
        self.lock().dropped += 1;
    }

    /// Stream of every outcome recorded after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Outcome> {
        self.observers.subscribe()
    }

    /// Owned copy of every counter, taken under a single lock.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut inner = self.lock();
        inner.seq += 1;

        StatsSnapshot {
            seq: inner.seq,
            taken_at: Utc::now(),
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            dispatched: inner.dispatched,
            dropped: inner.dropped,
            backends: inner.backends.iter().map(BackendCounters::stats).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub min_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    fn from_histogram(h: &Histogram<u64>) -> Self {
        if h.len() == 0 {
            return Self::default();
        }
        Self {
            samples: h.len(),
            min_us: h.min(),
            mean_us: h.mean() as u64,
            p50_us: h.value_at_quantile(0.50),
            p90_us: h.value_at_quantile(0.90),
            p95_us: h.value_at_quantile(0.95),
            p99_us: h.value_at_quantile(0.99),
            max_us: h.max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub name: String,
    pub total: u64,
    pub success: u64,
    pub http_errors: u64,
    /// Includes `timeouts`
    pub transport_errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub bytes: u64,
    pub status_counts: BTreeMap<u16, u64>,
    pub latency: LatencySummary,
}

impl BackendStats {
    /// Percentage of outcomes classified as success, 0 when nothing was recorded.
    pub fn success_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.success as f64 * 100.0) / self.total as f64
    }
}

/// Point-in-time copy of the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Strictly increasing across snapshots of one aggregator
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub backends: Vec<BackendStats>,
}

impl StatsSnapshot {
    pub fn backend(&self, name: &str) -> Option<&BackendStats> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn total_outcomes(&self) -> u64 {
        self.backends.iter().map(|b| b.total).sum()
    }

    /// Counter growth since `prev`, for exporters that publish deltas.
    pub fn delta_since(&self, prev: &StatsSnapshot) -> SnapshotDelta {
        let backends = self
            .backends
            .iter()
            .map(|cur| {
                let before = prev.backend(&cur.name);
                let sub = |f: fn(&BackendStats) -> u64| {
                    f(cur).saturating_sub(before.map(f).unwrap_or(0))
                };
                BackendDelta {
                    name: cur.name.clone(),
                    total: sub(|b| b.total),
                    success: sub(|b| b.success),
                    http_errors: sub(|b| b.http_errors),
                    transport_errors: sub(|b| b.transport_errors),
                    cancelled: sub(|b| b.cancelled),
                    bytes: sub(|b| b.bytes),
                }
            })
            .collect();

        SnapshotDelta {
            interval_ms: self.elapsed_ms.saturating_sub(prev.elapsed_ms),
            dispatched: self.dispatched.saturating_sub(prev.dispatched),
            dropped: self.dropped.saturating_sub(prev.dropped),
            backends,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    pub interval_ms: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub backends: Vec<BackendDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDelta {
    pub name: String,
    pub total: u64,
    pub success: u64,
    pub http_errors: u64,
    pub transport_errors: u64,
    pub cancelled: u64,
    pub bytes: u64,
}

impl BackendDelta {
    /// Outcomes per second over the delta's interval.
    pub fn rate(&self, interval_ms: u64) -> u64 {
        if interval_ms == 0 {
            return 0;
        }
        (self.total * 1000) / interval_ms
    }
}
