//! Single-shot upload, chunk upload, and merge-request endpoints.
//!
//! All three validate the signed link first.  If the uid's staging
//! directory is not on this node, the request is forwarded verbatim to
//! the peer that owns it; bodies are streamed through, never buffered.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use md5::{Digest, Md5};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::info;

use super::{publish_chunks, publish_meta};
use crate::cache;
use crate::errors::{ApiResponse, GatewayError};
use crate::lock::DistributedLock;
use crate::metadata::store::now_ts;
use crate::metadata::{ChunkRecord, FinalizeObject, ObjectRecord, ObjectStatus};
use crate::signing::check_link;
use crate::staging;
use crate::tasks::{CleanupPayload, MergePayload, KIND_CLEANUP, KIND_MERGE};
use crate::AppState;

// ── Shared pieces ───────────────────────────────────────────────────

/// Validate the signed-link parameters shared by all upload endpoints.
/// Returns the parsed uid.
fn validate_link(
    state: &AppState,
    uid: &str,
    date: &str,
    expire: &str,
    signature: &str,
) -> Result<i64, GatewayError> {
    let (uid, expire) = check_link(uid, date, expire)?;
    if !state.signer.check_upload(date, expire, signature) {
        return Err(GatewayError::SignatureMismatch);
    }
    Ok(uid)
}

/// Look up the object record for an upload request.
async fn upload_meta(state: &AppState, uid: i64) -> Result<ObjectRecord, GatewayError> {
    state
        .metadata
        .get_object(uid)
        .await?
        .ok_or_else(|| GatewayError::NotFound {
            message: format!("unknown uid {uid}"),
        })
}

/// Forward the original request to the peer owning `uid`'s staging
/// directory, streaming `body` through without buffering it.
async fn forward_to_owner(
    state: &Arc<AppState>,
    uid: i64,
    uri: &OriginalUri,
    body: Option<Body>,
) -> Result<Response, GatewayError> {
    let peer = state
        .registry
        .locate_owner(uid)
        .await
        .map_err(|e| GatewayError::Unavailable {
            message: format!("peer discovery failed: {e}"),
        })?
        .ok_or_else(|| GatewayError::Unavailable {
            message: format!("no live node owns upload {uid}"),
        })?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = state.registry.peer_url(&peer.addr(), path_and_query);
    info!(uid, peer = %peer.addr(), "forwarding upload request");

    let mut request = state.client.put(&url);
    if let Some(body) = body {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let response = request
        .send()
        .await
        .map_err(|e| GatewayError::Unavailable {
            message: format!("peer {} unreachable: {e}", peer.addr()),
        })?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Unavailable {
            message: format!("reading peer response failed: {e}"),
        })?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .map_err(anyhow::Error::from)?)
}

/// Stream the request body into `path`, hashing as it lands.
/// Returns (hex md5, size).
async fn receive_to_file(body: Body, path: &Path) -> anyhow::Result<(String, i64)> {
    let mut file = std::fs::File::create(path)?;
    let mut hasher = Md5::new();
    let mut size: i64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("reading request body: {e}"))?;
        hasher.update(&chunk);
        file.write_all(&chunk)?;
        size += chunk.len() as i64;
    }
    file.sync_all()?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Backend storage name for a finalized object.
fn storage_name_for(uid: i64, display_name: &str) -> String {
    let ext = staging::extension(display_name);
    if ext.is_empty() {
        uid.to_string()
    } else {
        format!("{uid}.{ext}")
    }
}

// ── PUT /upload ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub uid: String,
    pub hash: String,
    pub date: String,
    pub expire: String,
    pub signature: String,
}

/// Single-shot upload: stage, verify the declared hash, dedup, and
/// either alias an existing object or push to the store and finalize.
pub async fn upload_single(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<Response, GatewayError> {
    let uid = validate_link(&state, &query.uid, &query.date, &query.expire, &query.signature)?;
    let meta = upload_meta(&state, uid).await?;

    if meta.status == ObjectStatus::Complete {
        // Client retry after success; nothing left to do.
        return Ok(Json(ApiResponse::ok(())).into_response());
    }
    if !state.staging.owns(uid) {
        return forward_to_owner(&state, uid, &uri, Some(body)).await;
    }

    state.metadata.mark_uploading(uid).await?;
    let storage_name = storage_name_for(uid, &meta.name);
    let staged = state.staging.object_path(uid, &storage_name);
    let (computed, size) = receive_to_file(body, &staged).await?;

    if computed != query.hash {
        return Err(GatewayError::HashMismatch {
            computed,
            declared: query.hash,
        });
    }

    match state.metadata.find_complete_by_hash(&computed).await? {
        Some(existing) if existing.uid != uid => {
            info!(uid, src = existing.uid, "single-shot upload resolved by dedup alias");
            state.metadata.alias_object(uid, existing.uid).await?;
        }
        _ => {
            let content_type = staging::sniff_content_type(&staged)?;
            state.objects.make_bucket(&meta.bucket).await?;
            state
                .objects
                .put_object(&meta.bucket, &storage_name, &staged, &content_type)
                .await?;
            state
                .metadata
                .finalize_object(
                    uid,
                    FinalizeObject {
                        storage_name,
                        size,
                        hash: computed,
                        content_type,
                    },
                )
                .await?;
            info!(uid, size, "single-shot upload stored");
        }
    }

    if let Some(record) = state.metadata.get_object(uid).await? {
        publish_meta(&state, &record).await;
    }
    state.staging.remove(uid)?;
    Ok(Json(ApiResponse::ok(())).into_response())
}

// ── PUT /upload/multi ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MultiUploadQuery {
    pub uid: String,
    pub hash: String,
    #[serde(rename = "chunkNum")]
    pub chunk_num: String,
    pub date: String,
    pub expire: String,
    pub signature: String,
}

/// Chunk upload.  Registration is idempotent under client retry: the
/// (uid, index, hash) lock plus the already-registered check make a
/// duplicate submission a no-op.
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    Query(query): Query<MultiUploadQuery>,
    body: Body,
) -> Result<Response, GatewayError> {
    let uid = validate_link(&state, &query.uid, &query.date, &query.expire, &query.signature)?;
    let chunk_index: i64 = query
        .chunk_num
        .parse()
        .map_err(|e| GatewayError::InvalidParam {
            message: format!("invalid chunkNum parameter: {e}"),
        })?;
    if chunk_index < 0 {
        return Err(GatewayError::InvalidParam {
            message: format!("chunkNum must be non-negative, got {chunk_index}"),
        });
    }
    let meta = upload_meta(&state, uid).await?;

    if !state.staging.owns(uid) {
        return forward_to_owner(&state, uid, &uri, Some(body)).await;
    }

    // Fast path: same chunk already registered.
    if let Some(existing) = state.metadata.get_chunk(uid, chunk_index).await? {
        if existing.hash == query.hash {
            return Ok(Json(ApiResponse::ok(())).into_response());
        }
        return Err(GatewayError::InvalidParam {
            message: format!(
                "chunk {chunk_index} already registered with a different hash"
            ),
        });
    }

    let lock = DistributedLock::new(
        state.cache.clone(),
        format!("chunk:{uid}:{chunk_index}:{}", query.hash),
    );
    if !lock.acquire().await? {
        return Err(GatewayError::LockBusy);
    }
    let result = register_chunk(&state, &meta, uid, chunk_index, &query.hash, body).await;
    let _ = lock.release().await;
    result?;
    Ok(Json(ApiResponse::ok(())).into_response())
}

async fn register_chunk(
    state: &Arc<AppState>,
    meta: &ObjectRecord,
    uid: i64,
    chunk_index: i64,
    declared_hash: &str,
    body: Body,
) -> Result<(), GatewayError> {
    // Re-check under the lock: a concurrent retry may have won.
    if let Some(existing) = state.metadata.get_chunk(uid, chunk_index).await? {
        if existing.hash == declared_hash {
            return Ok(());
        }
        return Err(GatewayError::InvalidParam {
            message: format!("chunk {chunk_index} already registered with a different hash"),
        });
    }

    let staged = state.staging.chunk_path(uid, chunk_index);
    let (computed, size) = receive_to_file(body, &staged).await?;
    if computed != declared_hash {
        let _ = std::fs::remove_file(&staged);
        return Err(GatewayError::HashMismatch {
            computed,
            declared: declared_hash.to_string(),
        });
    }

    let name = staging::chunk_name(uid, chunk_index);
    state.objects.make_bucket(&meta.bucket).await?;
    state
        .objects
        .put_object(&meta.bucket, &name, &staged, "application/octet-stream")
        .await?;

    if meta.status == ObjectStatus::Pending {
        state.metadata.mark_uploading(uid).await?;
    }
    state
        .metadata
        .insert_chunk(ChunkRecord {
            uid,
            chunk_index,
            bucket: meta.bucket.clone(),
            storage_name: name,
            size,
            hash: computed,
            created_at: now_ts(),
        })
        .await?;
    // The published chunk list is stale now.
    state.cache.delete(&cache::chunks_key(uid)).await?;
    Ok(())
}

// ── PUT /upload/merge ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MergeQuery {
    pub uid: String,
    pub hash: String,
    /// Declared chunk total.
    pub num: String,
    /// Declared final size in bytes.
    pub size: String,
    pub date: String,
    pub expire: String,
    pub signature: String,
}

/// Merge request: verify the stored chunk set against the declared
/// total, then hand the assembly off to the task engine.  A count
/// mismatch enqueues a cleanup task and rejects.
pub async fn upload_merge(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    Query(query): Query<MergeQuery>,
) -> Result<Response, GatewayError> {
    let uid = validate_link(&state, &query.uid, &query.date, &query.expire, &query.signature)?;
    let declared: i64 = query.num.parse().map_err(|e| GatewayError::InvalidParam {
        message: format!("invalid num parameter: {e}"),
    })?;
    let size: i64 = query.size.parse().map_err(|e| GatewayError::InvalidParam {
        message: format!("invalid size parameter: {e}"),
    })?;
    let _meta = upload_meta(&state, uid).await?;

    if !state.staging.owns(uid) {
        return forward_to_owner(&state, uid, &uri, None).await;
    }

    let stored = state.metadata.count_chunks(uid).await?;
    if stored != declared {
        let task_id = state.task_ids.next_id().await?;
        let payload = serde_json::to_string(&CleanupPayload { uid }).map_err(anyhow::Error::from)?;
        state
            .metadata
            .insert_task(task_id, KIND_CLEANUP, &payload)
            .await?;
        info!(uid, stored, declared, task_id, "chunk set incomplete, cleanup enqueued");
        return Err(GatewayError::ChunkCountMismatch { stored, declared });
    }

    state
        .metadata
        .set_chunked(uid, declared, size, &query.hash)
        .await?;

    let task_id = state.task_ids.next_id().await?;
    let payload = serde_json::to_string(&MergePayload {
        uid,
        chunk_total: declared,
    })
    .map_err(anyhow::Error::from)?;
    state
        .metadata
        .insert_task(task_id, KIND_MERGE, &payload)
        .await?;
    info!(uid, chunks = declared, task_id, "merge task enqueued");

    // Republish current metadata and chunk list for pre-merge readers.
    state.cache.delete(&cache::meta_key(uid)).await?;
    state.cache.delete(&cache::chunks_key(uid)).await?;
    if let Some(record) = state.metadata.get_object(uid).await? {
        publish_meta(&state, &record).await;
    }
    let chunks = state.metadata.list_chunks(uid).await?;
    publish_chunks(&state, uid, &chunks).await;

    Ok(Json(ApiResponse::ok(())).into_response())
}
