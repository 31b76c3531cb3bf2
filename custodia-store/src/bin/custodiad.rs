//! Storage daemon: runs the health-probe and repair loops and keeps the
//! topology hot-reloadable. The put/get/delete surface is consumed
//! in-process by the platform services linking `custodia-store`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use custodia_store::config_watcher::spawn_config_watcher;
use custodia_store::{
    ConsistencyProbe, HealthAggregator, HealthCheckable, RepairService, StorageConfig,
    StorageEngine,
};

#[derive(Parser, Debug)]
#[command(name = "custodiad", about = "Custodia replicated object storage daemon")]
struct Args {
    /// Path to the storage configuration file
    #[arg(short, long, default_value = "custodia-store.toml")]
    config: PathBuf,

    /// How often to log the aggregate health report
    #[arg(long, default_value = "60")]
    health_log_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = StorageConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let engine = Arc::new(StorageEngine::new(config)?);
    let _probe_loop = engine.start();
    info!("storage engine started");

    let repair = Arc::new(RepairService::new(
        engine.cluster(),
        engine.health_monitor(),
        engine.tracker(),
        engine.metrics(),
    ));
    let _repair_loops = repair.spawn();

    let _watcher = spawn_config_watcher(args.config.clone(), engine.clone())?;

    let aggregator = HealthAggregator::new(vec![
        engine.health_monitor() as Arc<dyn HealthCheckable>,
        Arc::new(ConsistencyProbe::new(
            engine.cluster(),
            engine.health_monitor(),
            engine.tracker(),
        )) as Arc<dyn HealthCheckable>,
    ]);

    let health_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.health_log_secs.max(10)));
        loop {
            ticker.tick().await;
            let (overall, _reports) = aggregator.check_all().await;
            let report = health_engine.cluster_health();
            info!(
                state = overall.as_str(),
                detail = %serde_json::to_string(&report).unwrap_or_default(),
                "storage health"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
