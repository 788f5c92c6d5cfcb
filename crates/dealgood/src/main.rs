mod report;

use anyhow::{Context, Result};
use clap::Parser;
use dealgood_core::{
    open_source, BackendConfig, BackpressurePolicy, Dispatcher, ExperimentConfig,
    MockBackendClient, MockBehavior, RunError, SourceKind, SourceOptions, StatsAggregator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status for a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "dealgood")]
#[command(about = "Replay one request stream against several HTTP backends and compare them")]
struct Args {
    /// Name of the experiment
    #[arg(long, env = "DEALGOOD_EXPERIMENT", default_value = "adhoc")]
    experiment: String,

    /// Path to experiment file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "DEALGOOD_EXPERIMENT_FILE")]
    experiment_file: Option<PathBuf>,

    /// Request source: '-' reads JSON lines from stdin, 'random' uses builtin requests,
    /// 'nginxlog' replays an access log given by --source-param
    #[arg(long, env = "DEALGOOD_SOURCE", default_value = "-")]
    source: String,

    /// Parameter used by some sources
    #[arg(long, env = "DEALGOOD_SOURCE_PARAM")]
    source_param: Option<String>,

    /// Seed for the random source
    #[arg(long, env = "DEALGOOD_SEED", default_value_t = 0)]
    seed: u64,

    /// Add a cache-busting query parameter to random requests
    #[arg(long, env = "DEALGOOD_JITTER")]
    jitter: bool,

    /// Comma separated base URLs of backends (if not using an experiment file)
    #[arg(
        long,
        env = "DEALGOOD_TARGETS",
        value_delimiter = ',',
        default_value = "http://localhost:8080"
    )]
    targets: Vec<String>,

    /// Requests per second (if not using an experiment file)
    #[arg(long, env = "DEALGOOD_RATE", default_value_t = 10)]
    rate: i64,

    /// Maximum requests in flight (if not using an experiment file)
    #[arg(long, env = "DEALGOOD_CONCURRENCY", default_value_t = 10)]
    concurrency: i64,

    /// Duration in seconds (if not using an experiment file)
    #[arg(long, env = "DEALGOOD_DURATION", default_value_t = 60)]
    duration: i64,

    /// Per request timeout in seconds (if not using an experiment file)
    #[arg(long, env = "DEALGOOD_TIMEOUT")]
    timeout: Option<i64>,

    /// Host header to send with each request (if not using an experiment file)
    #[arg(long, env = "DEALGOOD_HOST")]
    host: Option<String>,

    /// What to do when all concurrency slots are busy: drop or wait
    /// (if not using an experiment file)
    #[arg(long, env = "DEALGOOD_BACKPRESSURE", default_value = "drop")]
    backpressure: String,

    /// Backend mode: http or mock
    #[arg(long, env = "DEALGOOD_MODE", default_value = "http")]
    mode: String,

    /// Simulated latency of mock backends
    #[arg(long, default_value_t = 5)]
    mock_latency_ms: u64,

    /// Print timings for every request
    #[arg(long, env = "DEALGOOD_TIMINGS", default_value_t = true, action = clap::ArgAction::Set)]
    timings: bool,

    /// Print failed requests to stderr
    #[arg(long, env = "DEALGOOD_FAILURES")]
    failures: bool,

    /// Suppress timings and failures output
    #[arg(long, env = "DEALGOOD_QUIET")]
    quiet: bool,

    /// Log a progress line every N milliseconds
    #[arg(long, env = "DEALGOOD_PRINT_EVERY_MS", default_value_t = 2000)]
    print_every_ms: u64,

    /// Write the final statistics as JSON into this directory
    #[arg(long, env = "DEALGOOD_RESULTS_DIR")]
    results_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = Args::parse();
    if args.quiet {
        args.timings = false;
        args.failures = false;
    }

    let kind: SourceKind = args.source.parse().context("source")?;
    let source_options = SourceOptions {
        param: args.source_param.clone(),
        seed: args.seed,
        jitter: args.jitter,
    };
    let mut source = open_source(kind, &source_options)
        .await
        .with_context(|| format!("{kind} source"))?;

    let config = load_experiment(&args)?;
    let experiment = config.validate().context("experiment")?;

    let dispatcher = match args.mode.as_str() {
        "http" => Dispatcher::http(&experiment).context("Failed to create HTTP client")?,
        "mock" => Dispatcher::new(Arc::new(MockBackendClient::new(MockBehavior::ok(
            Duration::from_millis(args.mock_latency_ms),
        )))),
        other => anyhow::bail!("Invalid mode: {}, must be 'http' or 'mock'", other),
    };

    info!(
        "Experiment '{}' against {} backends using {} source",
        experiment.name(),
        experiment.backends().len(),
        source.name()
    );

    let stats = Arc::new(StatsAggregator::new(experiment.backends()));
    let cancel = CancellationToken::new();
    let printers_done = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, draining in-flight requests");
                cancel.cancel();
            }
        });
    }

    let mut printers = Vec::new();
    if args.timings || args.failures {
        printers.push(tokio::spawn(report::print_outcomes(
            stats.subscribe(),
            args.timings,
            args.failures,
            printers_done.clone(),
        )));
    }
    if args.print_every_ms > 0 {
        printers.push(tokio::spawn(report::log_progress(
            stats.clone(),
            Duration::from_millis(args.print_every_ms),
            printers_done.clone(),
        )));
    }

    let result = dispatcher
        .run(&cancel, &experiment, source.as_mut(), stats.clone())
        .await;

    printers_done.cancel();
    for printer in printers {
        printer.await?;
    }

    let snapshot = stats.snapshot();
    let (report, exit) = match result {
        Ok(report) => (Some(report), ExitCode::SUCCESS),
        Err(RunError::Cancelled) => {
            warn!("Run cancelled");
            (None, ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => {
            report::print_summary(&experiment, &snapshot);
            return Err(e).context("run");
        }
    };

    if let Some(dir) = &args.results_dir {
        let path = report::write_results(dir, &experiment, report.as_ref(), &snapshot)?;
        info!("Results written to {}", path.display());
    }
    report::print_summary(&experiment, &snapshot);

    Ok(exit)
}

fn load_experiment(args: &Args) -> Result<ExperimentConfig> {
    if let Some(path) = &args.experiment_file {
        return ExperimentConfig::from_file(path)
            .with_context(|| format!("Failed to load experiment from {:?}", path));
    }

    let backpressure: BackpressurePolicy = args.backpressure.parse()?;
    let host = args.host.clone().filter(|h| !h.is_empty());

    Ok(ExperimentConfig {
        name: args.experiment.clone(),
        backends: args
            .targets
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| BackendConfig::new(t.trim()))
            .collect(),
        rate: args.rate,
        concurrency: args.concurrency,
        duration: args.duration,
        timeout: args.timeout,
        host,
        backpressure,
    })
}
