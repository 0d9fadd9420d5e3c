//! Abstract object-store trait.
//!
//! Every storage backend must implement [`ObjectStore`].  Uploads hand
//! the backend a staged local file rather than an in-memory buffer so
//! arbitrarily large objects never have to fit in RAM; reads are
//! windowed by (offset, length) for the same reason.

use bytes::Bytes;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Async object storage contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// Create a bucket if it does not already exist.  Idempotent.
    fn make_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read `length` bytes of `bucket/name` starting at `offset`.
    /// A negative `length` reads to the end of the object.  Reads past
    /// the end are truncated, never an error.
    fn get_object(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
        length: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;

    /// Store the file at `local_path` as `bucket/name`.
    fn put_object(
        &self,
        bucket: &str,
        name: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete `bucket/name`.  Deleting a missing object is not an error.
    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Total size of `bucket/name` in bytes.
    fn object_size(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;
}
