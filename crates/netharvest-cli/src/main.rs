//! netharvest: pulls Cloudflare network probes and NVD CVE records into a
//! document store.
//!
//! Exit codes: 0 every source succeeded, 1 some source failed, 2 the
//! configuration or the document store was unusable, 130 interrupted.

mod cli;

use anyhow::Context;
use clap::Parser;
use netharvest_config::Config;
use netharvest_db::{redact_url, DocumentStore, MemoryStore, PgDocumentStore};
use netharvest_ingestion::{Fetcher, Pipeline};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, LogFormat};

const EXIT_PARTIAL: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netharvest=info,info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut config = Config::load_from(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("validating configuration")?;

    let fetcher = Fetcher::from_config(&config.http)?;
    let store = open_store(&config, cli.dry_run).await?;
    let pipeline = Pipeline::from_config(&config, store.clone(), fetcher);

    Ok(harvest(&pipeline, store, interrupted()).await)
}

/// Run `pipeline` until it finishes or `shutdown` resolves, close `store`,
/// and map the outcome to an exit code.
async fn harvest<F>(pipeline: &Pipeline, store: Arc<dyn DocumentStore>, shutdown: F) -> u8
where
    F: Future<Output = ()>,
{
    let outcome = tokio::select! {
        biased;
        _ = shutdown => None,
        result = pipeline.run() => Some(result),
    };

    store.close().await;
    info!("Document store closed");

    match outcome {
        None => {
            warn!("Interrupted, run abandoned");
            EXIT_INTERRUPTED
        }
        Some(Err(e)) => {
            error!(error = %e, "Harvest aborted");
            EXIT_FATAL
        }
        Some(Ok(report)) if report.success => 0,
        Some(Ok(report)) => {
            for s in report.failed_sources() {
                warn!(
                    source = %s.source,
                    stage = s.failed_stage.map(|st| st.as_str()).unwrap_or("-"),
                    errors = ?s.errors,
                    "Source did not complete"
                );
            }
            EXIT_PARTIAL
        }
    }
}

/// Resolves on Ctrl-C. Without a signal handler it never resolves, so the
/// run is left to finish on its own.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn open_store(config: &Config, dry_run: bool) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if dry_run {
        info!("Dry run: documents are kept in memory");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db = &config.database;
    info!(url = %redact_url(&db.url), schema = %db.schema, "Connecting to Postgres...");
    let store = PgDocumentStore::connect(&db.url, &db.schema, db.max_connections, db.connect_timeout())
        .await
        .with_context(|| format!("connecting to {}", redact_url(&db.url)))?;
    Ok(Arc::new(store))
}
