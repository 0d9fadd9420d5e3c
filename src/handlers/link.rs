//! Link issuance, dedup probe, and chunk checkpoint endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{publish_chunks, query_escape};
use crate::cache;
use crate::errors::{ApiResponse, GatewayError};
use crate::metadata::store::now_ts;
use crate::metadata::{ChunkRecord, ObjectRecord, ObjectStatus};
use crate::signing::now_stamp;
use crate::staging;
use crate::AppState;

/// Expiry applied when a request does not set one (seconds).
const DEFAULT_EXPIRE: i64 = 86_400;

// ── POST /link/upload ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenUploadRequest {
    #[serde(rename = "filePath")]
    pub file_path: Vec<String>,
    #[serde(default)]
    pub expire: i64,
}

#[derive(Debug, Serialize)]
pub struct MultiUrls {
    pub upload: String,
    pub merge: String,
}

#[derive(Debug, Serialize)]
pub struct UploadUrls {
    pub single: String,
    pub multi: MultiUrls,
}

#[derive(Debug, Serialize)]
pub struct GenUploadItem {
    pub uid: String,
    pub url: UploadUrls,
    pub path: String,
}

/// Issue signed upload links, one per requested path.  Each link gets a
/// fresh uid, a pending metadata row, and a staging directory on this
/// node, which marks it as the uid's owner for cluster routing.
pub async fn gen_upload_links(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenUploadRequest>,
) -> Result<Json<ApiResponse<Vec<GenUploadItem>>>, GatewayError> {
    let limit = state.config.server.link_limit;
    if request.file_path.is_empty() {
        return Err(GatewayError::InvalidParam {
            message: "filePath must not be empty".to_string(),
        });
    }
    if request.file_path.len() > limit {
        return Err(GatewayError::InvalidParam {
            message: format!("filePath exceeds the per-request limit of {limit}"),
        });
    }
    let expire = if request.expire > 0 {
        request.expire
    } else {
        DEFAULT_EXPIRE
    };

    let mut created: Vec<i64> = Vec::with_capacity(request.file_path.len());
    let result = issue_upload_links(&state, &request.file_path, expire, &mut created).await;
    match result {
        Ok(items) => Ok(Json(ApiResponse::ok(items))),
        Err(e) => {
            // A half-issued batch must not leave ownership markers behind.
            for uid in &created {
                if let Err(remove_err) = state.staging.remove(*uid) {
                    warn!(uid, error = %remove_err, "failed to roll back staging dir");
                }
            }
            Err(e)
        }
    }
}

async fn issue_upload_links(
    state: &AppState,
    paths: &[String],
    expire: i64,
    created: &mut Vec<i64>,
) -> Result<Vec<GenUploadItem>, GatewayError> {
    let mut items = Vec::with_capacity(paths.len());
    let mut records = Vec::with_capacity(paths.len());
    let self_addr = state.registry.self_addr();
    for path in paths {
        let name = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path.as_str())
            .to_string();
        if name.is_empty() {
            return Err(GatewayError::InvalidParam {
                message: format!("invalid file path: {path}"),
            });
        }
        let bucket = staging::bucket_for_suffix(&name);
        let uid = state.snowflake.next_id()?;

        // The staging directory is what makes this node the owner.
        state.staging.create(uid)?;
        created.push(uid);

        let date = now_stamp();
        let signature = state.signer.sign_upload(&date, expire);
        let query = format!(
            "uid={uid}&date={}&expire={expire}&signature={signature}",
            query_escape(&date)
        );
        items.push(GenUploadItem {
            uid: uid.to_string(),
            url: UploadUrls {
                single: format!("/upload?{query}"),
                multi: MultiUrls {
                    upload: format!("/upload/multi?{query}"),
                    merge: format!("/upload/merge?{query}"),
                },
            },
            path: path.clone(),
        });

        let ts = now_ts();
        records.push(ObjectRecord {
            uid,
            bucket: bucket.to_string(),
            name,
            storage_name: String::new(),
            address: self_addr.clone(),
            hash: String::new(),
            size: 0,
            chunked: false,
            chunk_count: 0,
            status: ObjectStatus::Pending,
            content_type: "application/octet-stream".to_string(),
            created_at: ts.clone(),
            updated_at: ts,
        });
    }
    state.metadata.insert_objects(records).await?;

    Ok(items)
}

// ── POST /link/download ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenDownloadRequest {
    pub uid: Vec<String>,
    #[serde(default)]
    pub expire: i64,
}

#[derive(Debug, Serialize)]
pub struct DownloadMeta {
    #[serde(rename = "srcName")]
    pub src_name: String,
    #[serde(rename = "dstName")]
    pub dst_name: String,
    pub height: i64,
    pub width: i64,
    pub hash: String,
    pub size: String,
}

#[derive(Debug, Serialize)]
pub struct GenDownloadItem {
    pub uid: String,
    pub url: String,
    pub meta: DownloadMeta,
}

/// Issue signed download links for known uids.
pub async fn gen_download_links(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenDownloadRequest>,
) -> Result<Json<ApiResponse<Vec<GenDownloadItem>>>, GatewayError> {
    let limit = state.config.server.link_limit;
    if request.uid.is_empty() || request.uid.len() > limit {
        return Err(GatewayError::InvalidParam {
            message: format!("uid list must hold between 1 and {limit} entries"),
        });
    }
    let expire = if request.expire > 0 {
        request.expire
    } else {
        DEFAULT_EXPIRE
    };

    let mut items = Vec::with_capacity(request.uid.len());
    for uid_str in &request.uid {
        let uid: i64 = uid_str.parse().map_err(|e| GatewayError::InvalidParam {
            message: format!("invalid uid {uid_str}: {e}"),
        })?;
        let meta = state
            .metadata
            .get_object(uid)
            .await?
            .ok_or_else(|| GatewayError::NotFound {
                message: format!("unknown uid {uid}"),
            })?;

        let date = now_stamp();
        let signature =
            state
                .signer
                .sign_download(&date, expire, &meta.bucket, &meta.storage_name);
        let url = format!(
            "/download?uid={uid}&name={}&online=0&date={}&expire={expire}&bucket={}&object={}&signature={signature}",
            query_escape(&meta.name),
            query_escape(&date),
            query_escape(&meta.bucket),
            query_escape(&meta.storage_name),
        );
        items.push(GenDownloadItem {
            uid: uid.to_string(),
            url,
            meta: DownloadMeta {
                src_name: meta.name.clone(),
                dst_name: meta.storage_name.clone(),
                height: 0,
                width: 0,
                hash: meta.hash.clone(),
                size: meta.size.to_string(),
            },
        });
    }

    Ok(Json(ApiResponse::ok(items)))
}

// ── POST /resume ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResumeItem {
    pub hash: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub data: Vec<ResumeItem>,
}

#[derive(Debug, Serialize)]
pub struct ResumeResult {
    pub hash: String,
    /// Uid of an existing complete object with this hash, empty if none.
    pub uid: String,
}

/// Dedup probe: for each declared hash, report the uid of an already
/// complete object so the client can skip the upload entirely.
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<ApiResponse<Vec<ResumeResult>>>, GatewayError> {
    if request.data.is_empty() {
        return Err(GatewayError::InvalidParam {
            message: "data must not be empty".to_string(),
        });
    }
    let hashes: Vec<String> = request.data.iter().map(|d| d.hash.clone()).collect();
    let found = state.metadata.find_complete_by_hashes(&hashes).await?;

    let results = hashes
        .into_iter()
        .map(|hash| {
            let uid = found
                .get(&hash)
                .map(|record| record.uid.to_string())
                .unwrap_or_default();
            ResumeResult { hash, uid }
        })
        .collect();
    Ok(Json(ApiResponse::ok(results)))
}

// ── GET /checkpoint ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckpointQuery {
    pub uid: String,
}

/// Indices of already-registered chunks, so an interrupted client
/// resumes instead of re-sending everything.
pub async fn checkpoint(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckpointQuery>,
) -> Result<Json<ApiResponse<Vec<i64>>>, GatewayError> {
    let uid: i64 = query.uid.parse().map_err(|e| GatewayError::InvalidParam {
        message: format!("invalid uid parameter: {e}"),
    })?;

    // Cache-first; discard undecodable entries and refetch.
    if let Some(value) = state.cache.get(&cache::chunks_key(uid)).await? {
        if let Ok(chunks) = serde_json::from_str::<Vec<ChunkRecord>>(&value) {
            if !chunks.is_empty() {
                let indices = chunks.iter().map(|c| c.chunk_index).collect();
                return Ok(Json(ApiResponse::ok(indices)));
            }
        }
        state.cache.delete(&cache::chunks_key(uid)).await?;
    }

    let chunks = state.metadata.list_chunks(uid).await?;
    if chunks.is_empty() {
        return Err(GatewayError::InvalidParam {
            message: format!("uid {uid} has no registered chunks"),
        });
    }
    publish_chunks(&state, uid, &chunks).await;
    let indices = chunks.iter().map(|c| c.chunk_index).collect();
    Ok(Json(ApiResponse::ok(indices)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_link_batch_rolls_back_staging_dirs() {
        let dir = TempDir::new().unwrap();
        let state = test_util::state(&dir).await;

        // The empty path fails validation after the first dir is created.
        let request = GenUploadRequest {
            file_path: vec!["photos/cat.png".to_string(), String::new()],
            expire: 600,
        };
        let result = gen_upload_links(State(state.clone()), Json(request)).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_link_batch_creates_one_dir_per_path() {
        let dir = TempDir::new().unwrap();
        let state = test_util::state(&dir).await;

        let request = GenUploadRequest {
            file_path: vec!["a.png".to_string(), "b.mp4".to_string()],
            expire: 600,
        };
        let items = gen_upload_links(State(state.clone()), Json(request))
            .await
            .unwrap()
            .0
            .data
            .unwrap();
        assert_eq!(items.len(), 2);
        for item in &items {
            let uid: i64 = item.uid.parse().unwrap();
            assert!(state.staging.owns(uid));
            assert!(state.metadata.get_object(uid).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_checkpoint_without_chunks_is_rejected() {
        let dir = TempDir::new().unwrap();
        let state = test_util::state(&dir).await;

        let result = checkpoint(
            State(state.clone()),
            Query(CheckpointQuery {
                uid: "42".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::InvalidParam { .. })));
    }

    #[tokio::test]
    async fn test_checkpoint_lists_registered_indices() {
        let dir = TempDir::new().unwrap();
        let state = test_util::state(&dir).await;
        for i in [0i64, 2] {
            state
                .metadata
                .insert_chunk(ChunkRecord {
                    uid: 42,
                    chunk_index: i,
                    bucket: "video".to_string(),
                    storage_name: staging::chunk_name(42, i),
                    size: 4,
                    hash: String::new(),
                    created_at: now_ts(),
                })
                .await
                .unwrap();
        }

        let indices = checkpoint(
            State(state.clone()),
            Query(CheckpointQuery {
                uid: "42".to_string(),
            }),
        )
        .await
        .unwrap()
        .0
        .data
        .unwrap();
        assert_eq!(indices, vec![0, 2]);
    }
}
