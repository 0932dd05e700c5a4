//! NationLedger worker
//!
//! Resolves pending registry records and sweeps dangling artifacts against
//! the Postgres-backed registries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nationledger_core::{
    ArtifactStore, DanglingArtifactSweeper, LedgerConfig, LocalArtifactStore,
    MaterializationWorker, OrphanLog, PgOrphanLog, PgRegistry, Registries,
};

const REGISTRY_SCHEMA: &str =
    include_str!("../../nationledger-core/migrations/001_registry_records.sql");

#[derive(Parser, Debug)]
#[command(
    name = "nationledger-worker",
    about = "Materialization worker for the NationLedger registries"
)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "NATIONLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Lease owner id (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Run a single cycle and sweep, then exit
    #[arg(long)]
    once: bool,

    /// Apply the registry schema before starting
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nationledger_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LedgerConfig::load_from_file(path)?,
        None => LedgerConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(id) = args.worker_id {
        config.worker.worker_id = id;
    }

    let url = config
        .database
        .url
        .clone()
        .context("DATABASE_URL or NATIONLEDGER_DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&url)
        .await
        .context("Connecting to registry database")?;
    tracing::info!(
        max_connections = config.database.max_connections,
        "Connected to registry database"
    );

    if args.migrate {
        sqlx::raw_sql(REGISTRY_SCHEMA)
            .execute(&pool)
            .await
            .context("Applying registry schema")?;
        tracing::info!("Registry schema applied");
    }

    let registries = Registries::new(
        Arc::new(PgRegistry::restricted(pool.clone())),
        Arc::new(PgRegistry::public(pool.clone())),
    );
    let store: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(&config.storage.artifact_root));
    let staging: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(&config.storage.staging_root));
    let orphans: Arc<dyn OrphanLog> = Arc::new(PgOrphanLog::new(pool.clone()));

    let worker = Arc::new(
        MaterializationWorker::new(
            registries.clone(),
            staging.clone(),
            store.clone(),
            config.worker.clone(),
        )
        .with_orphan_log(orphans.clone()),
    );
    let sweeper = DanglingArtifactSweeper::new(registries, store, staging, orphans);

    tracing::info!(
        worker_id = %worker.worker_id(),
        artifact_root = %config.storage.artifact_root.display(),
        staging_root = %config.storage.staging_root.display(),
        "Configuration loaded"
    );

    if args.once {
        let report = worker.run_once().await?;
        tracing::info!(?report, "Cycle complete");
        sweeper.sweep().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_task = {
        let worker = worker.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    let sweep_interval = config.worker.sweep_interval();
    let sweeper_task = {
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => {
                        sweeper.sweep().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker_task.await {
        tracing::error!(error = %e, "Worker task panicked");
    }
    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "Sweeper task panicked");
    }

    pool.close().await;
    Ok(())
}
