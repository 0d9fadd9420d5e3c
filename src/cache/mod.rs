//! Shared cache contract and backends.
//!
//! The cache is a best-effort accelerator plus the substrate for the
//! distributed lock and the cluster registry.  Values are only ever
//! published with set-if-absent + TTL so a stale slow writer cannot
//! clobber a fresher value.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Cache key of a published object-metadata entry.
pub fn meta_key(uid: i64) -> String {
    format!("{uid}-meta")
}

/// Cache key of a published chunk-list entry.
pub fn chunks_key(uid: i64) -> String {
    format!("{uid}-chunks")
}

/// Async shared-cache contract.
///
/// `acquire_token` / `release_token` are the scripted check-and-set and
/// check-and-delete operations backing [`crate::lock::DistributedLock`];
/// both must be atomic with respect to concurrent callers.
pub trait Cache: Send + Sync + 'static {
    /// Get a string value.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;

    /// Set a value without expiry (used for durable worker-id mappings).
    fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Set a value only if the key is absent; returns whether it was set.
    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Refresh the TTL of an existing key; returns whether the key existed.
    fn refresh_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete a key (idempotent).
    fn delete(&self, key: &str)
        -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Atomically increment a counter, returning the new value.
    fn incr(&self, key: &str)
        -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>>;

    /// Set one field in a hash.
    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read all fields of a hash.
    fn hget_all(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>>;

    /// Delete one field from a hash (idempotent).
    fn hdel(
        &self,
        key: &str,
        field: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Scripted check-and-set: if the key already holds `token`, refresh its
    /// TTL; otherwise set it only if absent.  Returns whether this token now
    /// holds the key.
    fn acquire_token(
        &self,
        key: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Scripted check-and-delete: delete the key only if it still holds
    /// `token`.  Returns whether a deletion happened.
    fn release_token(
        &self,
        key: &str,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;
}
