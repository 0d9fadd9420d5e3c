//! Configuration loading and types for ObjGate.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, link signing, metadata persistence, object
//! storage, the shared cache, cluster membership, the task engine, and
//! local staging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Signed-URL settings.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Shared cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Cluster membership settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Merge/cleanup task engine settings.
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Local staging area settings.
    #[serde(default)]
    pub staging: StagingConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// URL scheme used when talking to peers.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Advertised node address; derived from the outbound IP when empty.
    #[serde(default)]
    pub advertise_ip: String,

    /// Maximum number of paths per link/resume request.
    #[serde(default = "default_link_limit")]
    pub link_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheme: default_scheme(),
            advertise_ip: String::new(),
            link_limit: default_link_limit(),
        }
    }
}

/// Signed-URL configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Keyed-hash secret for upload/download link signatures.
    #[serde(default = "default_signing_secret")]
    pub secret: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            secret: default_signing_secret(),
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,

    /// Step claimed per id-segment refill.
    #[serde(default = "default_segment_step")]
    pub segment_step: i64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            sqlite: SqliteConfig::default(),
            segment_step: default_segment_step(),
        }
    }
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local storage configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// Shared cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Backend type: `redis` or `memory`.
    ///
    /// `memory` is only meaningful for single-node deployments and tests;
    /// cluster features require `redis`.
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// TTL in seconds for published metadata entries.
    #[serde(default = "default_meta_ttl")]
    pub meta_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            meta_ttl_seconds: default_meta_ttl(),
        }
    }
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Seconds between successful heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Seconds after which a peer record is considered stale.
    #[serde(default = "default_stale_window")]
    pub stale_seconds: i64,

    /// Datacenter id stamped into snowflake ids (0..31).
    #[serde(default)]
    pub datacenter_id: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            stale_seconds: default_stale_window(),
            datacenter_id: 0,
        }
    }
}

/// Merge/cleanup task engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Number of worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded job queue depth.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Producer poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum automatic retries before a task fails permanently.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: i64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            poll_interval_ms: default_poll_interval(),
            retry_budget: default_retry_budget(),
        }
    }
}

/// Local staging area configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Root directory for per-uid staging directories.
    #[serde(default = "default_staging_root")]
    pub root_dir: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root_dir: default_staging_root(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_link_limit() -> usize {
    50
}

fn default_signing_secret() -> String {
    "objgate-signing-secret".to_string()
}

fn default_metadata_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_segment_step() -> i64 {
    1000
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_cache_backend() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_meta_ttl() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    180
}

fn default_stale_window() -> i64 {
    300
}

fn default_workers() -> usize {
    8
}

fn default_queue_depth() -> usize {
    200
}

fn default_poll_interval() -> u64 {
    500
}

fn default_retry_budget() -> i64 {
    5
}

fn default_staging_root() -> String {
    "./data/staging".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
