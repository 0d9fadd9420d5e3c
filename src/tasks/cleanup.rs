//! Cleanup task handler.
//!
//! Tears down an abandoned or rejected chunked upload: deletes the
//! already-uploaded chunk objects, their metadata rows, the object meta
//! row, any published cache entries, and the local staging directory.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::{CleanupPayload, TaskHandler};
use crate::cache::{self, Cache};
use crate::metadata::{MetadataStore, TaskRecord};
use crate::staging::Staging;
use crate::storage::ObjectStore;

pub struct CleanupHandler {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    cache: Arc<dyn Cache>,
    staging: Staging,
}

impl CleanupHandler {
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

    async fn cleanup(&self, task: &TaskRecord) -> anyhow::Result<()> {
        let payload: CleanupPayload =
            serde_json::from_str(&task.payload).context("undecodable cleanup payload")?;
        let uid = payload.uid;

        let chunks = self.store.list_chunks(uid).await?;
        for chunk in &chunks {
            self.objects
                .delete_object(&chunk.bucket, &chunk.storage_name)
                .await?;
        }
        self.store.delete_chunks(uid).await?;
        self.store.delete_object_meta(uid).await?;

        self.cache.delete(&cache::meta_key(uid)).await?;
        self.cache.delete(&cache::chunks_key(uid)).await?;
        self.staging.remove(uid)?;
        info!(uid, chunks = chunks.len(), "cleanup completed");
        Ok(())
    }
}

impl TaskHandler for CleanupHandler {
    fn pre_check(
        &self,
        task: &TaskRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let payload = task.payload.clone();
        Box::pin(async move {
            let payload: CleanupPayload =
                serde_json::from_str(&payload).context("undecodable cleanup payload")?;
            Ok(self.staging.owns(payload.uid))
        })
    }

    fn run(
        &self,
        task: &TaskRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let task = task.clone();
        Box::pin(async move { self.cleanup(&task).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::{ChunkRecord, ObjectRecord, ObjectStatus};
    use crate::staging;
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_removes_chunks_meta_and_staging() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteMetadataStore::new(":memory:").unwrap());
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let stg = Staging::new(dir.path()).unwrap();

        let ts = crate::metadata::store::now_ts();
        store
            .insert_objects(vec![ObjectRecord {
                uid: 42,
                bucket: "video".to_string(),
                name: "clip.mp4".to_string(),
                storage_name: String::new(),
                address: "127.0.0.1:8888".to_string(),
                hash: String::new(),
                size: 0,
                chunked: true,
                chunk_count: 3,
                status: ObjectStatus::Uploading,
                content_type: "application/octet-stream".to_string(),
                created_at: ts.clone(),
                updated_at: ts,
            }])
            .await
            .unwrap();
        stg.create(42).unwrap();
        for i in 0..3i64 {
            let name = staging::chunk_name(42, i);
            let local = stg.chunk_path(42, i);
            std::fs::write(&local, b"chunk").unwrap();
            objects
                .put_object("video", &name, &local, "application/octet-stream")
                .await
                .unwrap();
            store
                .insert_chunk(ChunkRecord {
                    uid: 42,
                    chunk_index: i,
                    bucket: "video".to_string(),
                    storage_name: name,
                    size: 5,
                    hash: staging::md5_bytes(b"chunk"),
                    created_at: crate::metadata::store::now_ts(),
                })
                .await
                .unwrap();
        }
        cache.set(&cache::meta_key(42), "{}").await.unwrap();

        let handler = CleanupHandler::new(store.clone(), objects.clone(), cache.clone(), stg.clone());
        let task = TaskRecord {
            id: 1,
            status: crate::metadata::TaskStatus::Running,
            kind: super::super::KIND_CLEANUP.to_string(),
            payload: serde_json::to_string(&CleanupPayload { uid: 42 }).unwrap(),
            node: "node-a".to_string(),
            task_log_id: 0,
            execute_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(handler.pre_check(&task).await.unwrap());
        handler.run(&task).await.unwrap();

        assert_eq!(store.count_chunks(42).await.unwrap(), 0);
        assert!(store.get_object(42).await.unwrap().is_none());
        assert!(objects.get_object("video", "42_0", 0, -1).await.is_err());
        assert!(cache.get(&cache::meta_key(42)).await.unwrap().is_none());
        assert!(!stg.owns(42));

        // Running cleanup again is harmless.
        handler.run(&task).await.unwrap();
    }
}
