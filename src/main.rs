//! snowdrift CLI: daily PostgreSQL snapshots to Parquet.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use snowdrift::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu};
use snowdrift::storage::{BackendConfig, date_path};
use snowdrift::{
    ColumnarLoader, Config, Orchestrator, PipelineError, PostgresExtractor, Scheduler,
    StorageProvider, cancel_on_signal, init_tracing, metrics,
};

/// Daily PostgreSQL table snapshots to Parquet on object storage.
#[derive(Parser, Debug)]
#[command(name = "snowdrift")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "snowdrift.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate configuration and print the plan without running.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run once per day at the configured hour (default).
    Schedule,
    /// Run once now and exit; the exit code reflects the run outcome.
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "snowdrift failed");
            eprintln!("Error: {}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), PipelineError> {
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;
    let command = args.command.unwrap_or(Command::Schedule);

    info!(
        config = %args.config.display(),
        tables = config.tables.len(),
        ?command,
        "snowdrift starting"
    );

    if args.dry_run {
        return print_plan(&config);
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let storage = StorageProvider::for_url_with_options(
        &config.sink.url,
        config.sink.storage_options.clone(),
    )
    .await?;
    let extractor = Arc::new(PostgresExtractor::new(&config.source)?);
    let loader = ColumnarLoader::new(Arc::new(storage), &config.sink);
    let orchestrator = Arc::new(Orchestrator::from_config(&config, extractor, loader));

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    match command {
        Command::Run => {
            let metadata = orchestrator.run(&shutdown).await?;
            info!(counts = ?metadata.counts, "Run succeeded");
            Ok(())
        }
        Command::Schedule => {
            Scheduler::new(orchestrator, &config.schedule)
                .run(shutdown)
                .await;
            Ok(())
        }
    }
}

/// Log what a run started now would do.
fn print_plan(config: &Config) -> Result<(), PipelineError> {
    BackendConfig::parse_url(&config.sink.url)?;

    let today = Local::now().date_naive();
    info!("Dry run mode - validating configuration");
    info!("Sink: {}", config.sink.url);
    info!("Metadata: {}", config.sink.metadata_key);
    info!(
        "Schedule: daily at {:02}:00 (run on start: {})",
        config.schedule.target_hour, config.schedule.run_on_start
    );
    for table in &config.tables {
        info!(
            "  - {} -> {} ({})",
            table.name,
            date_path(&table.name, today, "parquet"),
            table.query()
        );
    }
    info!("Configuration is valid");
    Ok(())
}
