//! ObjGate -- object storage gateway.
//!
//! Startup wires the whole system explicitly: metadata store, object
//! storage, cache, cluster registry, id generators, task engine, and
//! finally the HTTP server.  Shutdown drains in reverse order so tasks
//! claimed by this node are handed back to the cluster.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use objgate::cache::memory::MemoryCache;
use objgate::cache::redis::RedisCache;
use objgate::cache::Cache;
use objgate::cluster::{outbound_ip, ClusterRegistry};
use objgate::idgen::segment::SegmentAllocator;
use objgate::idgen::snowflake::Snowflake;
use objgate::metadata::sqlite::SqliteMetadataStore;
use objgate::metadata::MetadataStore;
use objgate::signing::LinkSigner;
use objgate::staging::Staging;
use objgate::storage::{LocalStore, MemoryStore, ObjectStore};
use objgate::tasks::cleanup::CleanupHandler;
use objgate::tasks::engine::Engine;
use objgate::tasks::merge::MergeHandler;
use objgate::tasks::{HandlerTable, KIND_CLEANUP, KIND_MERGE};

/// Command-line arguments for the ObjGate server.
#[derive(Parser, Debug)]
#[command(name = "objgate", version, about = "Object storage gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "objgate.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = objgate::config::load_config(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!("loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Metadata store (SQLite).
    let metadata_path = &config.metadata.sqlite.path;
    if let Some(parent) = std::path::Path::new(metadata_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(metadata_path)?);
    info!("metadata store ready at {metadata_path}");

    // Object storage backend.
    let objects: Arc<dyn ObjectStore> = match config.storage.backend.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        _ => {
            let root = &config.storage.local.root_dir;
            let backend = LocalStore::new(root)?;
            info!("local object storage ready at {root}");
            Arc::new(backend)
        }
    };

    // Shared cache.
    let cache: Arc<dyn Cache> = match config.cache.backend.as_str() {
        "memory" => Arc::new(MemoryCache::new()),
        _ => {
            let redis = RedisCache::connect(&config.cache.redis_url).await?;
            info!("redis cache connected at {}", config.cache.redis_url);
            Arc::new(redis)
        }
    };

    // Advertised address and cluster registry.
    let advertise_ip = if config.server.advertise_ip.is_empty() {
        outbound_ip()?
    } else {
        config.server.advertise_ip.clone()
    };
    let registry = Arc::new(ClusterRegistry::new(
        cache.clone(),
        config.server.scheme.clone(),
        advertise_ip,
        config.server.port,
        std::time::Duration::from_secs(config.cluster.heartbeat_interval_seconds),
        config.cluster.stale_seconds,
    ));
    registry.register().await?;
    let self_addr = registry.self_addr();
    info!(%self_addr, "registered with the cluster");

    let (heartbeat_stop_tx, heartbeat_stop_rx) = watch::channel(false);
    let heartbeat = tokio::spawn(registry.clone().run_heartbeat(heartbeat_stop_rx));

    // Id generators: snowflake for uids, segments for task ids.
    let snowflake =
        Snowflake::from_cache(&cache, config.cluster.datacenter_id, &self_addr).await?;
    let task_ids =
        SegmentAllocator::start(metadata.clone(), "task", config.metadata.segment_step).await?;

    let staging = Staging::new(&config.staging.root_dir)?;

    // Background task engine with its handler table.
    let handlers = HandlerTable::new()
        .with(
            KIND_MERGE,
            Arc::new(MergeHandler::new(
                metadata.clone(),
                objects.clone(),
                cache.clone(),
                staging.clone(),
            )),
        )
        .with(
            KIND_CLEANUP,
            Arc::new(CleanupHandler::new(
                metadata.clone(),
                objects.clone(),
                cache.clone(),
                staging.clone(),
            )),
        );
    let engine = Engine::start(metadata.clone(), handlers, self_addr.clone(), &config.tasks);
    info!(workers = config.tasks.workers, "task engine started");

    let state = Arc::new(objgate::AppState {
        config: config.clone(),
        metadata,
        objects,
        cache,
        registry,
        snowflake,
        task_ids,
        staging,
        signer: LinkSigner::new(config.signing.secret.clone()),
        client: reqwest::Client::new(),
    });

    let app = objgate::server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("objgate listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain: stop the heartbeat, then the engine, which requeues any
    // task this node claimed but never finished.
    let _ = heartbeat_stop_tx.send(true);
    let _ = heartbeat.await;
    engine.shutdown().await?;
    info!("objgate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
