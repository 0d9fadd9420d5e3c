//! Range-addressable streaming download endpoint.
//!
//! Bytes flow through a bounded hand-off queue between the fetch side
//! and the response writer, so memory stays fixed regardless of object
//! size.  Three sources feed the queue: windowed reads of a finalized
//! object, ordered parallel fetches of a still-chunked object, and a
//! relayed response from the peer that holds the data.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::publish_meta;
use crate::cache;
use crate::errors::GatewayError;
use crate::metadata::{ChunkRecord, ObjectRecord, ObjectStatus};
use crate::signing::check_link;
use crate::AppState;

/// Fixed read window for sequential streaming.
const WINDOW: u64 = 1024 * 1024;
/// Depth of the hand-off queue between fetcher and response writer.
const QUEUE_DEPTH: usize = 4;
/// Parallel fetch workers for a still-chunked object.
const CHUNK_FETCHERS: usize = 10;

type ByteResult = Result<Bytes, io::Error>;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub online: String,
    pub date: String,
    pub expire: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub object: String,
    pub signature: String,
}

/// GET /download: validate the signed link, resolve metadata, honor the
/// byte range, and stream.
pub async fn download(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, GatewayError> {
    let (uid, expire) = check_link(&query.uid, &query.date, &query.expire)?;
    if !state.signer.check_download(
        &query.date,
        expire,
        &query.bucket,
        &query.object,
        &query.signature,
    ) {
        return Err(GatewayError::SignatureMismatch);
    }

    let meta = resolve_meta(&state, uid).await?;
    if meta.status == ObjectStatus::Pending {
        return Err(GatewayError::NotFound {
            message: format!("uid {uid} has no uploaded content yet"),
        });
    }
    let size = meta.size as u64;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let display_name = if query.name.is_empty() {
        meta.name.clone()
    } else {
        query.name.clone()
    };
    let inline = query.online == "1";

    if size == 0 {
        return respond(&meta, &display_name, inline, StatusCode::OK, 0, None, Body::empty());
    }

    let (start, end) = parse_range(range_header.as_deref(), size)?;
    let full = start == 0 && end == size - 1;
    let status = if range_header.is_none() || full {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    };
    let content_range = (status == StatusCode::PARTIAL_CONTENT)
        .then(|| format!("bytes {start}-{end}/{size}"));

    let body = if meta.status == ObjectStatus::Complete {
        if !local_object_available(&state, &meta).await {
            return relay_from_peer(&state, &meta, uid, &uri, range_header.as_deref()).await;
        }
        stream_windows(&state, meta.clone(), start, end)
    } else {
        // Chunked object still awaiting merge.
        let chunks = resolve_chunks(&state, uid).await?;
        if chunks.is_empty() || !local_chunks_available(&state, &chunks).await {
            return relay_from_peer(&state, &meta, uid, &uri, range_header.as_deref()).await;
        }
        stream_chunks(&state, chunks, start, end)
    };

    respond(
        &meta,
        &display_name,
        inline,
        status,
        end - start + 1,
        content_range,
        body,
    )
}

fn respond(
    meta: &ObjectRecord,
    display_name: &str,
    inline: bool,
    status: StatusCode,
    length: u64,
    content_range: Option<String>,
    body: Body,
) -> Result<Response, GatewayError> {
    let disposition = if inline {
        "inline".to_string()
    } else {
        format!("attachment; filename=\"{display_name}\"")
    };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, &meta.content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, disposition);
    if let Ok(updated) = chrono::DateTime::parse_from_rfc3339(&meta.updated_at) {
        let stamp = httpdate::fmt_http_date(std::time::SystemTime::from(updated));
        builder = builder.header(header::LAST_MODIFIED, stamp);
    }
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    Ok(builder.body(body).map_err(anyhow::Error::from)?)
}

// ── Metadata resolution ─────────────────────────────────────────────

/// Cache-first metadata lookup.  A hit refreshes the TTL; a miss or an
/// undecodable entry falls back to the store and republishes.
async fn resolve_meta(state: &Arc<AppState>, uid: i64) -> Result<ObjectRecord, GatewayError> {
    let key = cache::meta_key(uid);
    let ttl = std::time::Duration::from_secs(state.config.cache.meta_ttl_seconds);
    if let Some(value) = state.cache.get(&key).await? {
        match serde_json::from_str::<ObjectRecord>(&value) {
            Ok(record) => {
                let _ = state.cache.refresh_ttl(&key, ttl).await;
                return Ok(record);
            }
            Err(e) => {
                warn!(uid, error = %e, "discarding undecodable cached metadata");
                state.cache.delete(&key).await?;
            }
        }
    }

    let record = state
        .metadata
        .get_object(uid)
        .await?
        .ok_or_else(|| GatewayError::NotFound {
            message: format!("unknown uid {uid}"),
        })?;
    publish_meta(state, &record).await;
    Ok(record)
}

/// Cache-first chunk-list lookup, ordered by index.
async fn resolve_chunks(
    state: &Arc<AppState>,
    uid: i64,
) -> Result<Vec<ChunkRecord>, GatewayError> {
    let key = cache::chunks_key(uid);
    if let Some(value) = state.cache.get(&key).await? {
        if let Ok(chunks) = serde_json::from_str::<Vec<ChunkRecord>>(&value) {
            return Ok(chunks);
        }
        state.cache.delete(&key).await?;
    }
    let chunks = state.metadata.list_chunks(uid).await?;
    super::publish_chunks(state, uid, &chunks).await;
    Ok(chunks)
}

async fn local_object_available(state: &Arc<AppState>, meta: &ObjectRecord) -> bool {
    state
        .objects
        .object_size(&meta.bucket, &meta.storage_name)
        .await
        .is_ok()
}

async fn local_chunks_available(state: &Arc<AppState>, chunks: &[ChunkRecord]) -> bool {
    match chunks.first() {
        Some(first) => state
            .objects
            .object_size(&first.bucket, &first.storage_name)
            .await
            .is_ok(),
        None => false,
    }
}

// ── Range parsing ───────────────────────────────────────────────────

/// Parse an HTTP `Range` header into an inclusive (start, end) pair.
/// No header means the whole object; an out-of-range or unparsable end
/// is clamped to `size - 1`.
fn parse_range(header: Option<&str>, size: u64) -> Result<(u64, u64), GatewayError> {
    let Some(header) = header else {
        return Ok((0, size - 1));
    };
    let ranges = header
        .strip_prefix("bytes=")
        .ok_or_else(|| GatewayError::InvalidParam {
            message: format!("malformed range header: {header}"),
        })?;
    // Only the first range of a multi-range request is honored.
    let range = ranges.split(',').next().unwrap_or("").trim();
    let (start_str, end_str) = range.split_once('-').ok_or_else(|| {
        GatewayError::InvalidParam {
            message: format!("malformed range header: {header}"),
        }
    })?;

    if start_str.is_empty() {
        // Suffix form: the last N bytes.
        let n: u64 = end_str.parse().map_err(|_| GatewayError::InvalidParam {
            message: format!("malformed range header: {header}"),
        })?;
        if n == 0 {
            return Err(GatewayError::InvalidParam {
                message: "zero-length suffix range".to_string(),
            });
        }
        return Ok((size.saturating_sub(n), size - 1));
    }

    let start: u64 = start_str.parse().map_err(|_| GatewayError::InvalidParam {
        message: format!("malformed range header: {header}"),
    })?;
    if start >= size {
        return Err(GatewayError::InvalidParam {
            message: format!("range start {start} beyond object size {size}"),
        });
    }
    let end = match end_str.parse::<u64>() {
        Ok(end) if end >= start && end < size => end,
        // Unparsable or past-end ends are clamped, not rejected.
        Ok(end) if end >= size => size - 1,
        Err(_) => size - 1,
        Ok(_) => {
            // Parsed but below the start: inverted range.
            return Err(GatewayError::InvalidParam {
                message: format!("malformed range header: {header}"),
            });
        }
    };
    Ok((start, end))
}

// ── Local sequential streaming ──────────────────────────────────────

/// Stream `[start, end]` of a finalized object in fixed windows through
/// a bounded queue.
fn stream_windows(state: &Arc<AppState>, meta: ObjectRecord, start: u64, end: u64) -> Body {
    let (tx, rx) = mpsc::channel::<ByteResult>(QUEUE_DEPTH);
    let objects = state.objects.clone();
    tokio::spawn(async move {
        let mut offset = start;
        while offset <= end {
            let len = WINDOW.min(end - offset + 1);
            match objects
                .get_object(&meta.bucket, &meta.storage_name, offset, len as i64)
                .await
            {
                Ok(data) => {
                    if data.is_empty() || tx.send(Ok(data)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    return;
                }
            }
            offset += len;
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

// ── Ordered parallel chunk streaming ────────────────────────────────

/// One chunk's byte window within the requested range.
struct ChunkSpan {
    bucket: String,
    storage_name: String,
    offset: u64,
    length: u64,
}

/// Map a global `[start, end]` range onto per-chunk spans by walking
/// cumulative chunk sizes.
fn chunk_spans(chunks: &[ChunkRecord], start: u64, end: u64) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut global = 0u64;
    for chunk in chunks {
        let chunk_size = chunk.size as u64;
        let chunk_start = global;
        let chunk_end = global + chunk_size; // exclusive
        global = chunk_end;
        if chunk_end <= start || chunk_start > end {
            continue;
        }
        let from = start.max(chunk_start) - chunk_start;
        let to = (end + 1).min(chunk_end) - chunk_start; // exclusive
        spans.push(ChunkSpan {
            bucket: chunk.bucket.clone(),
            storage_name: chunk.storage_name.clone(),
            offset: from,
            length: to - from,
        });
    }
    spans
}

/// Fetch chunk spans with bounded parallelism but deliver bytes in
/// strict index order: each span gets one result slot, fetchers fill
/// slots as they finish, and a single forwarder drains the slots in
/// order into the output queue.
fn stream_chunks(state: &Arc<AppState>, chunks: Vec<ChunkRecord>, start: u64, end: u64) -> Body {
    let spans = chunk_spans(&chunks, start, end);
    let (tx, rx) = mpsc::channel::<ByteResult>(QUEUE_DEPTH);
    let objects = state.objects.clone();

    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(CHUNK_FETCHERS));
        let mut slots = Vec::with_capacity(spans.len());
        for span in spans {
            let (slot_tx, slot_rx) = oneshot::channel::<anyhow::Result<Bytes>>();
            slots.push(slot_rx);
            let objects = objects.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = objects
                    .get_object(
                        &span.bucket,
                        &span.storage_name,
                        span.offset,
                        span.length as i64,
                    )
                    .await;
                let _ = slot_tx.send(result);
            });
        }

        for slot in slots {
            match slot.await {
                Ok(Ok(data)) => {
                    if tx.send(Ok(data)).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    return;
                }
                Err(_) => {
                    let _ = tx
                        .send(Err(io::Error::other("chunk fetcher dropped")))
                        .await;
                    return;
                }
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

// ── Peer relay ──────────────────────────────────────────────────────

/// Relay the original download request to the node holding the data,
/// streaming the forwarded body through in fixed windows.
async fn relay_from_peer(
    state: &Arc<AppState>,
    meta: &ObjectRecord,
    uid: i64,
    uri: &OriginalUri,
    range: Option<&str>,
) -> Result<Response, GatewayError> {
    // Prefer the live owner of the staging directory; fall back to the
    // node that issued the link.
    let addr = match state.registry.locate_owner(uid).await {
        Ok(Some(peer)) => peer.addr(),
        _ if !meta.address.is_empty() && !state.registry.is_self(&meta.address) => {
            meta.address.clone()
        }
        _ => {
            return Err(GatewayError::NotFound {
                message: format!("no node can serve uid {uid}"),
            })
        }
    };

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = state.registry.peer_url(&addr, path_and_query);
    info!(uid, peer = %addr, "relaying download");

    let mut request = state.client.get(&url);
    if let Some(range) = range {
        request = request.header(header::RANGE, range);
    }
    let mut response = request
        .send()
        .await
        .map_err(|e| GatewayError::Unavailable {
            message: format!("peer {addr} unreachable: {e}"),
        })?;

    let status = response.status();
    let mut builder = Response::builder().status(status);
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
        header::CONTENT_DISPOSITION,
    ] {
        if let Some(value) = response.headers().get(&name) {
            builder = builder.header(name, value);
        }
    }

    // The forwarded body is never buffered whole.
    let (tx, rx) = mpsc::channel::<ByteResult>(QUEUE_DEPTH);
    tokio::spawn(async move {
        loop {
            match response.chunk().await {
                Ok(Some(data)) => {
                    if tx.send(Ok(data)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }
    });

    Ok(builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(anyhow::Error::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: i64, size: i64) -> ChunkRecord {
        ChunkRecord {
            uid: 1,
            chunk_index: i,
            bucket: "video".to_string(),
            storage_name: format!("1_{i}"),
            size,
            hash: String::new(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_range_defaults_to_whole_object() {
        assert_eq!(parse_range(None, 1000).unwrap(), (0, 999));
    }

    #[test]
    fn test_open_ended_range() {
        assert_eq!(parse_range(Some("bytes=100-"), 1000).unwrap(), (100, 999));
    }

    #[test]
    fn test_bounded_range_and_clamping() {
        assert_eq!(parse_range(Some("bytes=10-19"), 1000).unwrap(), (10, 19));
        // Out-of-range end clamps to size - 1.
        assert_eq!(parse_range(Some("bytes=10-9999"), 1000).unwrap(), (10, 999));
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(parse_range(Some("bytes=-200"), 1000).unwrap(), (800, 999));
        // A suffix longer than the object covers it all.
        assert_eq!(parse_range(Some("bytes=-5000"), 1000).unwrap(), (0, 999));
    }

    #[test]
    fn test_malformed_ranges_rejected() {
        assert!(parse_range(Some("items=0-1"), 1000).is_err());
        assert!(parse_range(Some("bytes=abc-"), 1000).is_err());
        assert!(parse_range(Some("bytes=50-10"), 1000).is_err());
        assert!(parse_range(Some("bytes=1000-"), 1000).is_err());
        assert!(parse_range(Some("bytes=-0"), 1000).is_err());
    }

    #[test]
    fn test_unparsable_end_clamps() {
        assert_eq!(parse_range(Some("bytes=10-xyz"), 1000).unwrap(), (10, 999));
    }

    #[test]
    fn test_chunk_spans_cover_exact_range() {
        let chunks = vec![chunk(0, 100), chunk(1, 100), chunk(2, 100)];

        // Whole object: every chunk fully covered.
        let spans = chunk_spans(&chunks, 0, 299);
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.offset == 0 && s.length == 100));

        // Mid-object range straddling a chunk boundary.
        let spans = chunk_spans(&chunks, 150, 249);
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].offset, spans[0].length), (50, 50));
        assert_eq!((spans[1].offset, spans[1].length), (0, 50));

        // Range entirely inside one chunk.
        let spans = chunk_spans(&chunks, 110, 120);
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].offset, spans[0].length), (10, 11));
        assert_eq!(spans[0].storage_name, "1_1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chunked_stream_delivers_bytes_in_index_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = crate::test_util::state(&dir).await;

        // Eight distinguishable chunks, fetched concurrently.
        let mut expected = Vec::new();
        let mut chunks = Vec::new();
        for i in 0..8i64 {
            let data = vec![b'a' + i as u8; 1000];
            let local = dir.path().join(format!("part-{i}"));
            std::fs::write(&local, &data).unwrap();
            let name = format!("7_{i}");
            state
                .objects
                .put_object("video", &name, &local, "application/octet-stream")
                .await
                .unwrap();
            expected.extend_from_slice(&data);
            chunks.push(ChunkRecord {
                uid: 7,
                chunk_index: i,
                bucket: "video".to_string(),
                storage_name: name,
                size: 1000,
                hash: String::new(),
                created_at: String::new(),
            });
        }

        // Whole object.
        let body = stream_chunks(&state, chunks.clone(), 0, 7999);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &expected[..]);

        // Range cutting into the first and last covered chunks.
        let body = stream_chunks(&state, chunks, 500, 7499);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &expected[500..=7499]);
    }
}
