use anyhow::{Context, Result};
use dealgood_core::{BackendStats, Experiment, Outcome, RunReport, StatsAggregator, StatsSnapshot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct ExperimentResult<'a> {
    experiment: &'a str,
    timestamp: String,
    completed: bool,
    report: Option<&'a RunReport>,
    elapsed_ms: u64,
    dispatched: u64,
    dropped: u64,
    backends: &'a [BackendStats],
}

/// Print outcomes as they are recorded until `done` fires, then flush what is buffered.
pub async fn print_outcomes(
    mut rx: broadcast::Receiver<Outcome>,
    timings: bool,
    failures: bool,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(outcome) => print_outcome(&outcome, timings, failures),
                Err(RecvError::Lagged(n)) => warn!("Timings output fell behind, skipped {} outcomes", n),
                Err(RecvError::Closed) => return,
            },
            _ = done.cancelled() => break,
        }
    }

    loop {
        match rx.try_recv() {
            Ok(outcome) => print_outcome(&outcome, timings, failures),
            Err(TryRecvError::Lagged(n)) => warn!("Timings output fell behind, skipped {} outcomes", n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return,
        }
    }
}

fn print_outcome(outcome: &Outcome, timings: bool, failures: bool) {
    if failures && !outcome.class.is_success() {
        eprintln!("{}", format_outcome(outcome));
    } else if timings {
        println!("{}", format_outcome(outcome));
    }
}

fn format_outcome(outcome: &Outcome) -> String {
    format!(
        "{} {:<30} {:<20} {:>10.2}ms {:>10} {} {}",
        outcome.started_at.format("%H:%M:%S%.3f"),
        outcome.backend,
        outcome.class.to_string(),
        outcome.latency.as_secs_f64() * 1000.0,
        outcome
            .bytes
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string()),
        outcome.method,
        outcome.uri,
    )
}

/// Log per-backend progress from snapshot deltas every `every`.
pub async fn log_progress(stats: Arc<StatsAggregator>, every: Duration, done: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut prev = stats.snapshot();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = done.cancelled() => return,
        }

        let cur = stats.snapshot();
        let delta = cur.delta_since(&prev);
        for (be, d) in cur.backends.iter().zip(delta.backends.iter()) {
            info!(
                "Progress: backend={} total={} ok={} http_err={} transport_err={} rps={} p50={}ms p95={}ms p99={}ms",
                be.name,
                be.total,
                be.success,
                be.http_errors,
                be.transport_errors,
                d.rate(delta.interval_ms),
                be.latency.p50_us / 1000,
                be.latency.p95_us / 1000,
                be.latency.p99_us / 1000,
            );
        }
        if delta.dropped > 0 {
            info!("Progress: dropped {} requests in the last interval", delta.dropped);
        }
        prev = cur;
    }
}

pub fn print_summary(experiment: &Experiment, snapshot: &StatsSnapshot) {
    println!("\n=== Experiment {} Summary ===", experiment.name());
    println!("Duration: {}ms", snapshot.elapsed_ms);
    println!("Dispatched: {}", snapshot.dispatched);
    println!("Dropped: {}", snapshot.dropped);

    for be in &snapshot.backends {
        println!();
        println!("Backend: {}", be.name);
        println!("  Requests: {}", be.total);
        println!("  Success: {} ({:.1}%)", be.success, be.success_percent());
        println!("  HTTP errors: {}", be.http_errors);
        println!(
            "  Transport errors: {} (timeouts: {})",
            be.transport_errors, be.timeouts
        );
        println!("  Cancelled: {}", be.cancelled);
        println!("  Bytes: {}", be.bytes);
        let statuses: Vec<String> = be
            .status_counts
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect();
        if !statuses.is_empty() {
            println!("  Statuses: {}", statuses.join(" "));
        }
        println!(
            "  Latency: min={:.1}ms mean={:.1}ms p50={:.1}ms p90={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms",
            ms(be.latency.min_us),
            ms(be.latency.mean_us),
            ms(be.latency.p50_us),
            ms(be.latency.p90_us),
            ms(be.latency.p95_us),
            ms(be.latency.p99_us),
            ms(be.latency.max_us),
        );
    }
    println!();
}

fn ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

/// Write the final snapshot to `<dir>/dealgood_<experiment>_<timestamp>.json`.
pub fn write_results(
    dir: &Path,
    experiment: &Experiment,
    report: Option<&RunReport>,
    snapshot: &StatsSnapshot,
) -> Result<PathBuf> {
    let timestamp = chrono::Utc::now();
    let result = ExperimentResult {
        experiment: experiment.name(),
        timestamp: timestamp.to_rfc3339(),
        completed: report.is_some(),
        report,
        elapsed_ms: snapshot.elapsed_ms,
        dispatched: snapshot.dispatched,
        dropped: snapshot.dropped,
        backends: &snapshot.backends,
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results dir {:?}", dir))?;
    let file_name = format!(
        "dealgood_{}_{}.json",
        sanitize(experiment.name()),
        timestamp.format("%Y%m%d_%H%M%S")
    );
    let path = dir.join(file_name);
    let json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealgood_core::{ExperimentConfig, OutcomeClass, TransportErrorKind};

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("gw test/1"), "gw_test_1");
        assert_eq!(sanitize("adhoc"), "adhoc");
    }

    #[test]
    fn test_outcome_line_names_the_request() {
        let outcome = Outcome {
            backend: Arc::from("gw-b"),
            method: Arc::from("HEAD"),
            uri: Arc::from("/ipfs/bafkqaaa?format=car"),
            started_at: chrono::Utc::now(),
            latency: Duration::from_millis(12),
            class: OutcomeClass::Transport {
                kind: TransportErrorKind::Connect,
            },
            bytes: None,
        };
        let line = format_outcome(&outcome);
        assert!(line.contains("gw-b"), "{line}");
        assert!(line.contains("connect_error"), "{line}");
        assert!(line.ends_with("HEAD /ipfs/bafkqaaa?format=car"), "{line}");
    }

    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let exp = ExperimentConfig::adhoc("my exp", ["http://a"], 1, 1, 1)
            .validate()
            .unwrap();
        let stats = StatsAggregator::new(exp.backends());
        stats.record_dispatched();

        let path = write_results(dir.path(), &exp, None, &stats.snapshot()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("dealgood_my_exp_"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["experiment"], "my exp");
        assert_eq!(value["completed"], false);
        assert_eq!(value["dispatched"], 1);
        assert_eq!(value["backends"][0]["name"], "http://a");
    }
}
