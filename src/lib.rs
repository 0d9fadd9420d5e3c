//! ObjGate: object-storage gateway engine.
//!
//! This crate provides the components for running an object-storage
//! gateway: signed upload/download links, single-shot and chunked
//! uploads with content-hash dedup, range-addressable streaming
//! downloads, a background merge/cleanup task engine, and cluster
//! routing so any node can serve a request for data staged elsewhere.

use std::sync::Arc;

pub mod cache;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod idgen;
pub mod lock;
pub mod metadata;
pub mod server;
pub mod signing;
pub mod staging;
pub mod storage;
pub mod tasks;

use crate::cache::Cache;
use crate::cluster::ClusterRegistry;
use crate::config::Config;
use crate::idgen::segment::SegmentAllocator;
use crate::idgen::snowflake::Snowflake;
use crate::metadata::MetadataStore;
use crate::signing::LinkSigner;
use crate::staging::Staging;
use crate::storage::ObjectStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata store, the single source of truth.
    pub metadata: Arc<dyn MetadataStore>,
    /// Object storage backend.
    pub objects: Arc<dyn ObjectStore>,
    /// Shared cache (metadata accelerator, locks, registry).
    pub cache: Arc<dyn Cache>,
    /// Cluster membership and peer routing.
    pub registry: Arc<ClusterRegistry>,
    /// Upload-uid generator.
    pub snowflake: Snowflake,
    /// Task-id allocator.
    pub task_ids: SegmentAllocator,
    /// Node-local staging area.
    pub staging: Staging,
    /// Signed-link generator/verifier.
    pub signer: LinkSigner,
    /// HTTP client for forwarding requests to peers.
    pub client: reqwest::Client,
}
