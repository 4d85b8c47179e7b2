//! Strata controller daemon.
//!
//! Boots the metadata store, topic manager, and coordinator from a shared
//! data directory, joins the meta-cluster, takes leadership of the
//! configured clusters, and runs the background monitors until interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::info;

use strata_cluster::{MastershipController, ResourceCoordinator, SqliteResourceCoordinator};
use strata_controller::{
    BackupVersionCleanupTask, ControllerConfig, LifecycleEngine, MigrationMonitor,
};
use strata_metadata::SqliteMetadataStore;
use strata_topics::SqliteTopicManager;

#[derive(Parser, Debug)]
#[command(name = "strata-controller", about = "Strata cluster controller")]
struct Args {
    /// Directory holding the controller's databases.
    #[arg(long, default_value = "./strata-data")]
    data_dir: PathBuf,

    /// Unique id of this controller instance.
    #[arg(long)]
    controller_id: String,

    /// Properties file (JSON object of string key/values).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Clusters to manage, overriding the config file.
    #[arg(long, value_delimiter = ',')]
    clusters: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let props: HashMap<String, String> =
                serde_json::from_str(&raw).context("parsing config properties")?;
            ControllerConfig::from_properties(&props)
        }
        None => ControllerConfig::default(),
    };
    if !args.clusters.is_empty() {
        config.clusters = args.clusters.clone();
    }
    if config.clusters.is_empty() {
        anyhow::bail!("no clusters configured; pass --clusters or a config file");
    }

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data dir {}", args.data_dir.display()))?;
    let db_path = |name: &str| format!("sqlite://{}", args.data_dir.join(name).display());

    let metadata = Arc::new(
        SqliteMetadataStore::new(args.data_dir.join("metadata.db"))
            .await
            .context("opening metadata store")?,
    );
    let topics = Arc::new(
        SqliteTopicManager::new(&db_path("bus.db"))
            .await
            .context("opening topic registry")?,
    );
    let coordinator = Arc::new(
        SqliteResourceCoordinator::new(&db_path("coordinator.db"))
            .await
            .context("opening coordinator")?,
    );

    let coordinator_dyn: Arc<dyn ResourceCoordinator> = Arc::clone(&coordinator) as Arc<dyn ResourceCoordinator>;
    let mastership = Arc::new(MastershipController::new(
        args.controller_id.clone(),
        config.controller_cluster_name.clone(),
        config.controller_cluster_replica,
        Arc::clone(&coordinator_dyn),
    ));
    mastership.start_renewal_task().await;

    let writer = topics.writer();
    let engine = Arc::new(LifecycleEngine::new(
        config.clone(),
        metadata,
        Arc::clone(&topics) as Arc<dyn strata_topics::TopicManager>,
        writer,
        coordinator_dyn,
        Arc::clone(&mastership),
    ));

    for cluster in &config.clusters {
        engine
            .start_cluster(cluster)
            .await
            .with_context(|| format!("starting cluster {cluster}"))?;
        info!(cluster = %cluster, "Cluster started");
    }

    let (migration_shutdown_tx, migration_shutdown_rx) = oneshot::channel();
    let migration_handle =
        Arc::new(MigrationMonitor::new(Arc::clone(&engine))).start(migration_shutdown_rx);
    let (cleanup_shutdown_tx, cleanup_shutdown_rx) = oneshot::channel();
    let cleanup_handle =
        Arc::new(BackupVersionCleanupTask::new(Arc::clone(&engine))).start(cleanup_shutdown_rx);

    info!(controller = %args.controller_id, "Strata controller running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");

    let _ = migration_shutdown_tx.send(());
    let _ = cleanup_shutdown_tx.send(());
    let _ = migration_handle.await;
    let _ = cleanup_handle.await;

    for cluster in &config.clusters {
        if let Err(e) = engine.stop_cluster(cluster).await {
            tracing::warn!(cluster = %cluster, error = %e, "Failed to stop cluster cleanly");
        }
    }
    mastership.stop_renewal_task().await;
    Ok(())
}
