//! HTTP request handlers.
//!
//! Handlers stay thin: parameter validation and response shaping here,
//! the actual work in the metadata/storage/task layers.  Responses use
//! the `{code, message, data}` JSON envelope except for download, which
//! streams raw bytes.

pub mod download;
pub mod link;
pub mod probe;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::cache;
use crate::metadata::{ChunkRecord, ObjectRecord};
use crate::AppState;

/// Characters escaped when embedding a value in a query string.
const QUERY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'/')
    .add(b':')
    .add(b'=');

/// Percent-encode one query-string value.
pub(crate) fn query_escape(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ESCAPE).to_string()
}

/// Publish an object record to the cache with set-if-absent + TTL so a
/// stale slow writer can never clobber a fresher entry.
pub(crate) async fn publish_meta(state: &Arc<AppState>, record: &ObjectRecord) {
    let ttl = Duration::from_secs(state.config.cache.meta_ttl_seconds);
    if let Ok(value) = serde_json::to_string(record) {
        if let Err(e) = state
            .cache
            .set_nx(&cache::meta_key(record.uid), &value, ttl)
            .await
        {
            tracing::debug!(uid = record.uid, error = %e, "metadata publish skipped");
        }
    }
}

/// Publish an object's chunk list to the cache, same policy as
/// [`publish_meta`].
pub(crate) async fn publish_chunks(state: &Arc<AppState>, uid: i64, chunks: &[ChunkRecord]) {
    let ttl = Duration::from_secs(state.config.cache.meta_ttl_seconds);
    if let Ok(value) = serde_json::to_string(chunks) {
        if let Err(e) = state
            .cache
            .set_nx(&cache::chunks_key(uid), &value, ttl)
            .await
        {
            tracing::debug!(uid, error = %e, "chunk list publish skipped");
        }
    }
}
