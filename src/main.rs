use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use config::ConfigError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "metrics")]
use docflat::config::context::setup_metrics;
use docflat::{
    config::{
        context::build_store,
        schema::{load_config, DocflatConfig},
    },
    context::SyncContext,
    discovery::{discover, DiscoveryOptions},
    schema::Tables,
    store::StoreError,
    sync::{sync, SyncError},
};

#[derive(Debug, Parser)]
#[clap(
    name = "docflat",
    version,
    about = "Flattens a document database into tables, writing one JSON line per resource"
)]
struct Args {
    #[clap(short, long, default_value = "docflat.toml")]
    config: PathBuf,

    #[clap(long, help = "Only discover the tables and print their schemas")]
    discover_only: bool,

    #[clap(long, help = "Output logs as JSON")]
    json_logs: bool,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Error loading the config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Error writing the output: {0}")]
    Io(#[from] io::Error),

    #[error("Error serializing the output: {0}")]
    Json(#[from] serde_json::Error),
}

// Logs go to stderr, stdout is reserved for the output
fn prepare_tracing(json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    if json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    prepare_tracing(args.json_logs);

    info!("Starting docflat {}", env!("CARGO_PKG_VERSION"));

    let result = match load_config(&args.config) {
        Ok(config) => run(config, args.discover_only).await,
        Err(err) => Err(err.into()),
    };

    if let Err(err) = result {
        error!("{err}");
        exit(1);
    }
}

async fn run(config: DocflatConfig, discover_only: bool) -> Result<(), Error> {
    #[cfg(feature = "metrics")]
    {
        if let Some(ref metrics) = config.misc.metrics {
            setup_metrics(metrics)?;
        }
    }

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, stopping");
            ctrl_c_token.cancel();
        }
    });

    let store = build_store(&config.source)?;
    let options = config.sync.options();

    let tables = discover(store.clone(), &DiscoveryOptions::from(&options), &token).await?;
    if discover_only {
        return print_schemas(&tables);
    }

    let ctx = Arc::new(SyncContext::new(config.source.client_id(), tables));
    let (tx, mut rx) = mpsc::channel(config.sync.channel_capacity);
    let sync_task = tokio::spawn(sync(ctx.clone(), store, options, tx, token.clone()));

    let mut out = BufWriter::new(io::stdout());
    while let Some(resource) = rx.recv().await {
        if let Err(err) = writeln!(out, "{}", resource.to_json()) {
            token.cancel();
            return Err(err.into());
        }
    }
    out.flush()?;

    let result = sync_task.await.map_err(|e| SyncError::TaskFailed {
        reason: e.to_string(),
    })?;

    for (table, clients) in ctx.metrics().snapshot() {
        for (client, metrics) in clients {
            info!(
                table = %table,
                client = %client,
                resources = metrics.resources,
                skipped = metrics.skipped,
                errors = metrics.errors,
                "Sync metrics"
            );
        }
    }
    info!("Emitted {} resource(s)", ctx.metrics().total_resources());

    result?;
    Ok(())
}

fn print_schemas(tables: &Tables) -> Result<(), Error> {
    let mut out = BufWriter::new(io::stdout());
    for table in tables.iter() {
        let line = serde_json::json!({
            "table": table.name,
            "parent": table.parent,
            "primary_key": table.primary_keys(),
            "schema": serde_json::to_value(table.arrow_schema().as_ref())?,
        });
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}
