//! CLI entry point.
//!
//! Exit codes: 0 on graceful completion, including a user interrupt that
//! drained cleanly; 1 on unrecoverable startup errors. Steady-state
//! partition failures are logged and reflected only in the run summary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use court_harvester::config::AppConfig;
use court_harvester::logging::init_logging;
use court_harvester::orchestrator::{Orchestrator, RunMode};
use court_harvester::parse::ResultTableParser;
use court_harvester::report::TracingReporter;
use court_harvester::resilience::CircuitBreaker;
use court_harvester::store::{CaseStore, JsonFileStore};
use court_harvester::worker::RegionWorkerFactory;

struct CliArgs {
    mode: RunMode,
    config_path: PathBuf,
}

fn usage() -> &'static str {
    "usage: court-harvester [--mode parse|update|gaps] [--config PATH]"
}

fn parse_args() -> Result<CliArgs> {
    let mut mode = RunMode::Parse;
    let mut config_path = PathBuf::from("config.json");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args.next().context("--mode requires a value")?;
                mode = value.parse()?;
            }
            "--config" => {
                let value = args.next().context("--config requires a value")?;
                config_path = PathBuf::from(value);
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}\n{}", usage()),
        }
    }
    Ok(CliArgs { mode, config_path })
}

async fn run() -> Result<()> {
    let args = parse_args()?;
    let config = AppConfig::load(&args.config_path).await?;
    init_logging(&config.logging)?;

    info!(mode = args.mode.as_str(), "court-harvester starting");

    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let store: Arc<dyn CaseStore> =
        Arc::new(JsonFileStore::open(config.store_path.clone()).await?);
    let parser = Arc::new(ResultTableParser::new());
    let factory = Arc::new(RegionWorkerFactory::new(
        &config,
        Arc::clone(&breaker),
        parser,
        Arc::clone(&store),
    ));
    let reporter = Arc::new(TracingReporter::new(config.reporting.clone()));

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        factory,
        store,
        reporter,
        config.partitions.clone(),
        config.scan.clone(),
        config.pacing.clone(),
        config.concurrency.clone(),
        shutdown.clone(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down");
                shutdown.cancel();
            }
        }
    });

    let summary = orchestrator.run(args.mode).await;
    if summary.interrupted {
        info!("run interrupted, exiting after graceful drain");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
