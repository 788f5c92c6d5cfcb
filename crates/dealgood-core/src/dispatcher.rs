use crate::client::{invoke, BackendClient, HttpBackendClient};
use crate::config::{Backend, BackpressurePolicy, Experiment};
use crate::error::RunError;
use crate::pacer::Pacer;
use crate::request::Request;
use crate::source::RequestSource;
use crate::stats::StatsAggregator;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a run that was not cancelled stopped issuing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Duration,
    SourceExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub reason: StopReason,
    pub dispatched: u64,
    pub dropped: u64,
    pub elapsed: Duration,
}

/// The experiment engine: paces requests from a source, fans each one out to
/// every backend and records the outcomes.
pub struct Dispatcher {
    client: Arc<dyn BackendClient>,
}

enum Stop {
    Done(StopReason),
    Failed(RunError),
}

impl Dispatcher {
    pub fn new(client: Arc<dyn BackendClient>) -> Self {
        Self { client }
    }

    /// Dispatcher sending real HTTP requests with the experiment's timeout.
    pub fn http(experiment: &Experiment) -> Result<Self, RunError> {
        let client = HttpBackendClient::for_experiment(experiment)?;
        Ok(Self::new(Arc::new(client)))
    }

    pub fn client_name(&self) -> &'static str {
        self.client.name()
    }

    /// Run `experiment` until its duration elapses, `source` is exhausted or
    /// `cancel` fires. Requests that obtained a concurrency slot always finish
    /// and yield one outcome per backend before this returns.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        experiment: &Experiment,
        source: &mut dyn RequestSource,
        stats: Arc<StatsAggregator>,
    ) -> Result<RunReport, RunError> {
        let backends: Arc<[Arc<Backend>]> =
            experiment.backends().iter().cloned().map(Arc::new).collect();
        let policy = experiment.backpressure();
        let call_timeout = experiment.timeout();
        let slots = Arc::new(Semaphore::new(experiment.concurrency()));
        let mut pacer = Pacer::new(experiment.rate());
        let deadline = sleep(experiment.duration());
        tokio::pin!(deadline);

        info!(
            experiment = experiment.name(),
            backends = backends.len(),
            rate = experiment.rate(),
            concurrency = experiment.concurrency(),
            duration_s = experiment.duration().as_secs(),
            backpressure = %policy,
            source = source.name(),
            client = self.client.name(),
            "starting experiment"
        );

        let start = Instant::now();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut dispatched = 0u64;
        let mut dropped = 0u64;

        let stop = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Failed(RunError::Cancelled),
                _ = &mut deadline => break Stop::Done(StopReason::Duration),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined);
                    continue;
                }
                _ = pacer.tick() => {}
            }

            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Failed(RunError::Cancelled),
                _ = &mut deadline => break Stop::Done(StopReason::Duration),
                next = source.next_request() => match next {
                    Ok(Some(request)) => request,
                    Ok(None) => break Stop::Done(StopReason::SourceExhausted),
                    Err(e) => break Stop::Failed(RunError::Source(e)),
                },
            };

            let permit = match policy {
                BackpressurePolicy::Drop => match slots.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        dropped += 1;
                        stats.record_dropped();
                        debug!(uri = %request.uri, "no free slot, dropping request");
                        continue;
                    }
                },
                BackpressurePolicy::Wait => {
                    let acquired = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(Stop::Failed(RunError::Cancelled)),
                        _ = &mut deadline => Err(Stop::Done(StopReason::Duration)),
                        permit = slots.clone().acquire_owned() => Ok(permit.ok()),
                    };
                    match acquired {
                        Ok(Some(permit)) => permit,
                        Ok(None) => {
                            dropped += 1;
                            stats.record_dropped();
                            continue;
                        }
                        Err(stop) => {
                            dropped += 1;
                            stats.record_dropped();
                            break stop;
                        }
                    }
                }
            };

            dispatched += 1;
            stats.record_dispatched();
            in_flight.spawn(fan_out(
                self.client.clone(),
                backends.clone(),
                Arc::new(request),
                call_timeout,
                stats.clone(),
                cancel.clone(),
                permit,
            ));
        };

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "waiting for in-flight requests to complete");
        }
        while let Some(joined) = in_flight.join_next().await {
            reap(joined);
        }

        let elapsed = start.elapsed();
        match stop {
            Stop::Done(reason) => {
                info!(
                    ?reason,
                    dispatched,
                    dropped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "experiment finished"
                );
                Ok(RunReport {
                    reason,
                    dispatched,
                    dropped,
                    elapsed,
                })
            }
            Stop::Failed(err) => {
                info!(
                    error = %err,
                    dispatched,
                    dropped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "experiment stopped"
                );
                Err(err)
            }
        }
    }
}

/// Send one request to every backend concurrently. The slot is released once
/// all backend calls have recorded their outcome.
async fn fan_out(
    client: Arc<dyn BackendClient>,
    backends: Arc<[Arc<Backend>]>,
    request: Arc<Request>,
    call_timeout: Duration,
    stats: Arc<StatsAggregator>,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let mut calls = JoinSet::new();
    for backend in backends.iter().cloned() {
        let client = client.clone();
        let request = request.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();

        calls.spawn(async move {
            let outcome = invoke(client.as_ref(), &backend, &request, call_timeout, &cancel).await;
            if let Err(e) = stats.record(outcome) {
                warn!(error = %e, "outcome not recorded");
            }
        });
    }

    while let Some(joined) = calls.join_next().await {
        reap(joined);
    }
    drop(permit);
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "dispatch task failed");
    }
}
