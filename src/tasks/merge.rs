//! Merge task handler.
//!
//! Concatenates a verified chunk set into the final object.  Only the
//! node holding the staging directory claims the task; chunks are read
//! from staging when present and fetched back from the object store
//! otherwise.  The assembled file's hash must equal the declared hash
//! or the attempt fails without touching object metadata.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::{MergePayload, TaskHandler};
use crate::cache::{self, Cache};
use crate::metadata::{FinalizeObject, MetadataStore, TaskRecord};
use crate::staging::{self, Staging};
use crate::storage::ObjectStore;

pub struct MergeHandler {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    cache: Arc<dyn Cache>,
    staging: Staging,
}

impl MergeHandler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        cache: Arc<dyn Cache>,
        staging: Staging,
    ) -> Self {
        Self {
            store,
            objects,
            cache,
            staging,
        }
    }

    async fn merge(&self, task: &TaskRecord) -> anyhow::Result<()> {
        let payload: MergePayload =
            serde_json::from_str(&task.payload).context("undecodable merge payload")?;
        let uid = payload.uid;

        let meta = self
            .store
            .get_object(uid)
            .await?
            .with_context(|| format!("no object metadata for uid {uid}"))?;

        let chunks = self.store.list_chunks(uid).await?;
        anyhow::ensure!(
            chunks.len() as i64 == payload.chunk_total,
            "stored chunk count {} does not match declared total {}",
            chunks.len(),
            payload.chunk_total
        );
        for (i, chunk) in chunks.iter().enumerate() {
            anyhow::ensure!(
                chunk.chunk_index == i as i64,
                "chunk indices are not dense at position {i}"
            );
        }

        // Assemble into the staging directory so a crash mid-merge
        // leaves nothing visible in the object store.
        let assembled = self.staging.dir(uid).join("assembled");
        {
            let mut out = std::fs::File::create(&assembled)?;
            for chunk in &chunks {
                let local = self.staging.chunk_path(uid, chunk.chunk_index);
                if local.is_file() {
                    let data = std::fs::read(&local)?;
                    out.write_all(&data)?;
                } else {
                    let data = self
                        .objects
                        .get_object(&chunk.bucket, &chunk.storage_name, 0, -1)
                        .await?;
                    out.write_all(&data)?;
                }
            }
            out.sync_all()?;
        }

        let computed = staging::md5_file(&assembled)?;
        anyhow::ensure!(
            computed == meta.hash,
            "assembled hash {computed} does not match declared {}",
            meta.hash
        );
        let size = std::fs::metadata(&assembled)?.len() as i64;

        // Same dedup check as a single-shot upload.
        match self.store.find_complete_by_hash(&computed).await? {
            Some(existing) if existing.uid != uid => {
                info!(uid, src = existing.uid, "merge resolved by dedup alias");
                self.store.alias_object(uid, existing.uid).await?;
            }
            _ => {
                let ext = staging::extension(&meta.name);
                let storage_name = if ext.is_empty() {
                    uid.to_string()
                } else {
                    format!("{uid}.{ext}")
                };
                let content_type = staging::sniff_content_type(&assembled)?;
                self.objects.make_bucket(&meta.bucket).await?;
                self.objects
                    .put_object(&meta.bucket, &storage_name, &assembled, &content_type)
                    .await?;
                self.store
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
            }
        }

        // Stale published entries must not outlive the merge.
        self.cache.delete(&cache::meta_key(uid)).await?;
        self.cache.delete(&cache::chunks_key(uid)).await?;
        self.staging.remove(uid)?;
        info!(uid, size, "merge completed");
        Ok(())
    }
}

impl TaskHandler for MergeHandler {
    fn pre_check(
        &self,
        task: &TaskRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let payload = task.payload.clone();
        Box::pin(async move {
            let payload: MergePayload =
                serde_json::from_str(&payload).context("undecodable merge payload")?;
            // Only the staging owner assembles; other nodes leave it pending.
            Ok(self.staging.owns(payload.uid))
        })
    }

    fn run(
        &self,
        task: &TaskRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let task = task.clone();
        Box::pin(async move { self.merge(&task).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::{ChunkRecord, ObjectRecord, ObjectStatus};
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        cache: Arc<dyn Cache>,
        staging: Staging,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        Fixture {
            store: Arc::new(SqliteMetadataStore::new(":memory:").unwrap()),
            objects: Arc::new(MemoryStore::new()),
            cache: Arc::new(MemoryCache::new()),
            staging: Staging::new(dir.path()).unwrap(),
            _dir: dir,
        }
    }

    fn handler(f: &Fixture) -> MergeHandler {
        MergeHandler::new(
            f.store.clone(),
            f.objects.clone(),
            f.cache.clone(),
            f.staging.clone(),
        )
    }

    fn task(id: i64, payload: &MergePayload) -> TaskRecord {
        TaskRecord {
            id,
            status: crate::metadata::TaskStatus::Running,
            kind: super::super::KIND_MERGE.to_string(),
            payload: serde_json::to_string(payload).unwrap(),
            node: "node-a".to_string(),
            task_log_id: 0,
            execute_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// Stage `parts` as uid's chunks, with metadata declaring `hash`.
    async fn stage_upload(f: &Fixture, uid: i64, parts: &[&[u8]], hash: &str) {
        let ts = crate::metadata::store::now_ts();
        f.store
            .insert_objects(vec![ObjectRecord {
                uid,
                bucket: "video".to_string(),
                name: "movie.mp4".to_string(),
                storage_name: String::new(),
                address: "10.0.0.1:8888".to_string(),
                hash: String::new(),
                size: 0,
                chunked: false,
                chunk_count: 0,
                status: ObjectStatus::Pending,
                content_type: "application/octet-stream".to_string(),
                created_at: ts.clone(),
                updated_at: ts.clone(),
            }])
            .await
            .unwrap();
        let total: i64 = parts.iter().map(|p| p.len() as i64).sum();
        f.store
            .set_chunked(uid, parts.len() as i64, total, hash)
            .await
            .unwrap();

        f.staging.create(uid).unwrap();
        for (i, part) in parts.iter().enumerate() {
            std::fs::write(f.staging.chunk_path(uid, i as i64), part).unwrap();
            f.store
                .insert_chunk(ChunkRecord {
                    uid,
                    chunk_index: i as i64,
                    bucket: "video".to_string(),
                    storage_name: staging::chunk_name(uid, i as i64),
                    size: part.len() as i64,
                    hash: staging::md5_bytes(part),
                    created_at: ts.clone(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_merge_assembles_and_finalizes() {
        let f = fixture();
        let full = b"hello chunked world".to_vec();
        let hash = staging::md5_bytes(&full);
        stage_upload(&f, 42, &[&full[..6], &full[6..12], &full[12..]], &hash).await;

        let h = handler(&f);
        h.run(&task(1, &MergePayload { uid: 42, chunk_total: 3 }))
            .await
            .unwrap();

        let meta = f.store.get_object(42).await.unwrap().unwrap();
        assert_eq!(meta.status, ObjectStatus::Complete);
        assert_eq!(meta.hash, hash);
        assert_eq!(meta.size, full.len() as i64);

        let stored = f
            .objects
            .get_object(&meta.bucket, &meta.storage_name, 0, -1)
            .await
            .unwrap();
        assert_eq!(&stored[..], &full[..]);
        // Staging is gone, so this node no longer owns the uid.
        assert!(!f.staging.owns(42));
    }

    #[tokio::test]
    async fn test_wrong_declared_hash_fails_without_finalizing() {
        let f = fixture();
        stage_upload(&f, 42, &[b"abc", b"def"], "0000deadbeef0000").await;

        let h = handler(&f);
        let err = h
            .run(&task(1, &MergePayload { uid: 42, chunk_total: 2 }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match declared"));

        // Metadata untouched: never marked complete.
        let meta = f.store.get_object(42).await.unwrap().unwrap();
        assert_ne!(meta.status, ObjectStatus::Complete);
    }

    #[tokio::test]
    async fn test_chunk_count_mismatch_fails() {
        let f = fixture();
        let full = b"abcdef".to_vec();
        stage_upload(&f, 42, &[&full[..3], &full[3..]], &staging::md5_bytes(&full)).await;

        let h = handler(&f);
        let err = h
            .run(&task(1, &MergePayload { uid: 42, chunk_total: 3 }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chunk count"));
    }

    #[tokio::test]
    async fn test_merge_dedups_against_existing_object() {
        let f = fixture();
        let full = b"identical bytes".to_vec();
        let hash = staging::md5_bytes(&full);

        // An earlier upload already completed with the same content.
        let ts = crate::metadata::store::now_ts();
        f.store
            .insert_objects(vec![ObjectRecord {
                uid: 7,
                bucket: "video".to_string(),
                name: "orig.mp4".to_string(),
                storage_name: String::new(),
                address: String::new(),
                hash: String::new(),
                size: 0,
                chunked: false,
                chunk_count: 0,
                status: ObjectStatus::Pending,
                content_type: String::new(),
                created_at: ts.clone(),
                updated_at: ts,
            }])
            .await
            .unwrap();
        f.store
            .finalize_object(
                7,
                FinalizeObject {
                    storage_name: "7.mp4".to_string(),
                    size: full.len() as i64,
                    hash: hash.clone(),
                    content_type: "video/mp4".to_string(),
                },
            )
            .await
            .unwrap();

        stage_upload(&f, 42, &[&full[..5], &full[5..]], &hash).await;
        let h = handler(&f);
        h.run(&task(1, &MergePayload { uid: 42, chunk_total: 2 }))
            .await
            .unwrap();

        // The alias points at the original's storage; nothing new stored.
        let alias = f.store.get_object(42).await.unwrap().unwrap();
        assert_eq!(alias.status, ObjectStatus::Complete);
        assert_eq!(alias.storage_name, "7.mp4");
        assert!(f
            .objects
            .get_object("video", "42.mp4", 0, -1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pre_check_requires_local_staging() {
        let f = fixture();
        let h = handler(&f);
        let t = task(1, &MergePayload { uid: 99, chunk_total: 1 });
        assert!(!h.pre_check(&t).await.unwrap());
        f.staging.create(99).unwrap();
        assert!(h.pre_check(&t).await.unwrap());
    }
}
