//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{
    now_ts, ChunkRecord, FinalizeObject, IdRange, MetadataStore, ObjectRecord, ObjectStatus,
    TaskLogRecord, TaskRecord, TaskStatus,
};

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// Idempotent, safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Objects
            CREATE TABLE IF NOT EXISTS objects (
                uid          INTEGER PRIMARY KEY,
                bucket       TEXT NOT NULL,
                name         TEXT NOT NULL,
                storage_name TEXT NOT NULL DEFAULT '',
                address      TEXT NOT NULL DEFAULT '',
                hash         TEXT NOT NULL DEFAULT '',
                size         INTEGER NOT NULL DEFAULT 0,
                chunked      INTEGER NOT NULL DEFAULT 0,
                chunk_count  INTEGER NOT NULL DEFAULT 0,
                status       TEXT NOT NULL DEFAULT 'pending',
                content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_objects_hash_status
                ON objects(hash, status);

            -- Chunks
            CREATE TABLE IF NOT EXISTS chunks (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                uid          INTEGER NOT NULL,
                chunk_index  INTEGER NOT NULL,
                bucket       TEXT NOT NULL,
                storage_name TEXT NOT NULL,
                size         INTEGER NOT NULL,
                hash         TEXT NOT NULL,
                created_at   TEXT NOT NULL,

                UNIQUE (uid, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_uid
                ON chunks(uid);

            -- Tasks
            CREATE TABLE IF NOT EXISTS tasks (
                id            INTEGER PRIMARY KEY,
                status        TEXT NOT NULL DEFAULT 'pending',
                kind          TEXT NOT NULL,
                payload       TEXT NOT NULL DEFAULT '',
                node          TEXT NOT NULL DEFAULT '',
                task_log_id   INTEGER NOT NULL DEFAULT 0,
                execute_count INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status
                ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_node
                ON tasks(node);

            -- Task logs (append-only)
            CREATE TABLE IF NOT EXISTS task_logs (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id    INTEGER NOT NULL,
                status     TEXT NOT NULL,
                error_info TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_logs_task
                ON task_logs(task_id);

            -- Id segments
            CREATE TABLE IF NOT EXISTS id_segments (
                business_id TEXT PRIMARY KEY,
                max_id      INTEGER NOT NULL DEFAULT 0,
                step        INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

fn map_object(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let status: String = row.get("status")?;
    Ok(ObjectRecord {
        uid: row.get("uid")?,
        bucket: row.get("bucket")?,
        name: row.get("name")?,
        storage_name: row.get("storage_name")?,
        address: row.get("address")?,
        hash: row.get("hash")?,
        size: row.get("size")?,
        chunked: row.get::<_, i64>("chunked")? != 0,
        chunk_count: row.get("chunk_count")?,
        status: ObjectStatus::parse(&status)
            .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
        content_type: row.get("content_type")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn map_chunk(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        uid: row.get("uid")?,
        chunk_index: row.get("chunk_index")?,
        bucket: row.get("bucket")?,
        storage_name: row.get("storage_name")?,
        size: row.get("size")?,
        hash: row.get("hash")?,
        created_at: row.get("created_at")?,
    })
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get("status")?;
    Ok(TaskRecord {
        id: row.get("id")?,
        status: TaskStatus::parse(&status)
            .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
        kind: row.get("kind")?,
        payload: row.get("payload")?,
        node: row.get("node")?,
        task_log_id: row.get("task_log_id")?,
        execute_count: row.get("execute_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn map_task_log(row: &Row<'_>) -> rusqlite::Result<TaskLogRecord> {
    let status: String = row.get("status")?;
    Ok(TaskLogRecord {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        status: TaskStatus::parse(&status)
            .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
        error_info: row.get("error_info")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl MetadataStore for SqliteMetadataStore {
    fn insert_objects(
        &self,
        records: Vec<ObjectRecord>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction()?;
            for r in &records {
                tx.execute(
                    "INSERT INTO objects
                        (uid, bucket, name, storage_name, address, hash, size,
                         chunked, chunk_count, status, content_type,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        r.uid,
                        r.bucket,
                        r.name,
                        r.storage_name,
                        r.address,
                        r.hash,
                        r.size,
                        r.chunked as i64,
                        r.chunk_count,
                        r.status.as_str(),
                        r.content_type,
                        r.created_at,
                        r.updated_at,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get_object(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let record = conn
                .query_row(
                    "SELECT * FROM objects WHERE uid = ?1",
                    params![uid],
                    map_object,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn find_complete_by_hash(
        &self,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let hash = hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let record = conn
                .query_row(
                    "SELECT * FROM objects
                     WHERE hash = ?1 AND status = 'complete' AND hash != ''
                     ORDER BY uid LIMIT 1",
                    params![hash],
                    map_object,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn find_complete_by_hashes(
        &self,
        hashes: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, ObjectRecord>>> + Send + '_>>
    {
        let hashes = hashes.to_vec();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut found = HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT * FROM objects
                 WHERE hash = ?1 AND status = 'complete' AND hash != ''
                 ORDER BY uid LIMIT 1",
            )?;
            for hash in &hashes {
                if let Some(record) = stmt.query_row(params![hash], map_object).optional()? {
                    found.insert(hash.clone(), record);
                }
            }
            Ok(found)
        })
    }

    fn mark_uploading(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE objects SET status = 'uploading', updated_at = ?2 WHERE uid = ?1",
                params![uid, now_ts()],
            )?;
            Ok(())
        })
    }

    fn set_chunked(
        &self,
        uid: i64,
        chunk_count: i64,
        size: i64,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let hash = hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE objects
                 SET chunked = 1, chunk_count = ?2, size = ?3, hash = ?4,
                     status = 'uploading', updated_at = ?5
                 WHERE uid = ?1",
                params![uid, chunk_count, size, hash, now_ts()],
            )?;
            Ok(())
        })
    }

    fn finalize_object(
        &self,
        uid: i64,
        fields: FinalizeObject,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE objects
                 SET status = 'complete', storage_name = ?2, size = ?3,
                     hash = ?4, content_type = ?5, updated_at = ?6
                 WHERE uid = ?1",
                params![
                    uid,
                    fields.storage_name,
                    fields.size,
                    fields.hash,
                    fields.content_type,
                    now_ts(),
                ],
            )?;
            Ok(())
        })
    }

    fn alias_object(
        &self,
        uid: i64,
        src_uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // Copy the source's storage location in one statement so the
            // alias can never observe a half-written source row.
            let updated = conn.execute(
                "UPDATE objects
                 SET status = 'complete',
                     bucket = (SELECT bucket FROM objects WHERE uid = ?2),
                     storage_name = (SELECT storage_name FROM objects WHERE uid = ?2),
                     size = (SELECT size FROM objects WHERE uid = ?2),
                     hash = (SELECT hash FROM objects WHERE uid = ?2),
                     content_type = (SELECT content_type FROM objects WHERE uid = ?2),
                     updated_at = ?3
                 WHERE uid = ?1
                   AND EXISTS (SELECT 1 FROM objects WHERE uid = ?2)",
                params![uid, src_uid, now_ts()],
            )?;
            anyhow::ensure!(updated == 1, "alias source {src_uid} or target {uid} missing");
            Ok(())
        })
    }

    fn delete_object_meta(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute("DELETE FROM objects WHERE uid = ?1", params![uid])?;
            Ok(())
        })
    }

    fn insert_chunk(
        &self,
        record: ChunkRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO chunks
                    (uid, chunk_index, bucket, storage_name, size, hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.uid,
                    record.chunk_index,
                    record.bucket,
                    record.storage_name,
                    record.size,
                    record.hash,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
    }

    fn get_chunk(
        &self,
        uid: i64,
        chunk_index: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ChunkRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let record = conn
                .query_row(
                    "SELECT * FROM chunks WHERE uid = ?1 AND chunk_index = ?2",
                    params![uid, chunk_index],
                    map_chunk,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn list_chunks(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ChunkRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt =
                conn.prepare("SELECT * FROM chunks WHERE uid = ?1 ORDER BY chunk_index")?;
            let rows = stmt.query_map(params![uid], map_chunk)?;
            let mut chunks = Vec::new();
            for row in rows {
                chunks.push(row?);
            }
            Ok(chunks)
        })
    }

    fn count_chunks(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    fn delete_chunks(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute("DELETE FROM chunks WHERE uid = ?1", params![uid])?;
            Ok(())
        })
    }

    fn insert_task(
        &self,
        id: i64,
        kind: &str,
        payload: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let kind = kind.to_string();
        let payload = payload.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let ts = now_ts();
            conn.execute(
                "INSERT INTO tasks (id, status, kind, payload, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?4)",
                params![id, kind, payload, ts],
            )?;
            Ok(())
        })
    }

    fn get_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<TaskRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let record = conn
                .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], map_task)
                .optional()?;
            Ok(record)
        })
    }

    fn list_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<TaskRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt =
                conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at")?;
            let rows = stmt.query_map(params![status.as_str()], map_task)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            Ok(tasks)
        })
    }

    fn claim_task(
        &self,
        id: i64,
        node: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let node = node.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // Conditional update: succeeds for exactly one racing claimer.
            let updated = conn.execute(
                "UPDATE tasks SET status = 'running', node = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, node, now_ts()],
            )?;
            Ok(updated == 1)
        })
    }

    fn finish_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE tasks
                 SET status = 'done', execute_count = execute_count + 1, updated_at = ?2
                 WHERE id = ?1",
                params![id, now_ts()],
            )?;
            Ok(())
        })
    }

    fn requeue_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE tasks
                 SET status = 'pending', node = '',
                     execute_count = execute_count + 1, updated_at = ?2
                 WHERE id = ?1",
                params![id, now_ts()],
            )?;
            Ok(())
        })
    }

    fn fail_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE tasks
                 SET status = 'failed', execute_count = execute_count + 1, updated_at = ?2
                 WHERE id = ?1",
                params![id, now_ts()],
            )?;
            Ok(())
        })
    }

    fn reset_node_tasks(
        &self,
        node: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>> {
        let node = node.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let reset = conn.execute(
                "UPDATE tasks SET status = 'pending', node = '', updated_at = ?2
                 WHERE node = ?1 AND status = 'running'",
                params![node, now_ts()],
            )?;
            Ok(reset)
        })
    }

    fn set_task_log(
        &self,
        id: i64,
        log_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE tasks SET task_log_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, log_id, now_ts()],
            )?;
            Ok(())
        })
    }

    fn insert_task_log(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let ts = now_ts();
            conn.execute(
                "INSERT INTO task_logs (task_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![task_id, status.as_str(), ts],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn update_task_log(
        &self,
        log_id: i64,
        status: TaskStatus,
        error_info: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let error_info = error_info.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE task_logs SET status = ?2, error_info = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![log_id, status.as_str(), error_info, now_ts()],
            )?;
            Ok(())
        })
    }

    fn list_task_logs(
        &self,
        task_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<TaskLogRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt =
                conn.prepare("SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![task_id], map_task_log)?;
            let mut logs = Vec::new();
            for row in rows {
                logs.push(row?);
            }
            Ok(logs)
        })
    }

    fn seed_segment(
        &self,
        business_id: &str,
        step: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let business_id = business_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let ts = now_ts();
            conn.execute(
                "INSERT OR IGNORE INTO id_segments
                    (business_id, max_id, step, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?3, ?3)",
                params![business_id, step, ts],
            )?;
            Ok(())
        })
    }

    fn claim_segment(
        &self,
        business_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<IdRange>> + Send + '_>> {
        let business_id = business_id.to_string();
        Box::pin(async move {
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction()?;
            let (max_id, step): (i64, i64) = tx.query_row(
                "SELECT max_id, step FROM id_segments WHERE business_id = ?1",
                params![business_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.execute(
                "UPDATE id_segments SET max_id = ?2, updated_at = ?3 WHERE business_id = ?1",
                params![business_id, max_id + step, now_ts()],
            )?;
            tx.commit()?;
            Ok(IdRange {
                start: max_id + 1,
                end: max_id + step,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").unwrap()
    }

    fn object(uid: i64, bucket: &str, name: &str) -> ObjectRecord {
        let ts = now_ts();
        ObjectRecord {
            uid,
            bucket: bucket.to_string(),
            name: name.to_string(),
            storage_name: String::new(),
            address: "10.0.0.1:8888".to_string(),
            hash: String::new(),
            size: 0,
            chunked: false,
            chunk_count: 0,
            status: ObjectStatus::Pending,
            content_type: "application/octet-stream".to_string(),
            created_at: ts.clone(),
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn test_object_lifecycle() {
        let store = store();
        store
            .insert_objects(vec![object(1, "image", "cat.png")])
            .await
            .unwrap();

        let rec = store.get_object(1).await.unwrap().unwrap();
        assert_eq!(rec.status, ObjectStatus::Pending);
        assert_eq!(rec.name, "cat.png");

        store.mark_uploading(1).await.unwrap();
        let rec = store.get_object(1).await.unwrap().unwrap();
        assert_eq!(rec.status, ObjectStatus::Uploading);

        store
            .finalize_object(
                1,
                FinalizeObject {
                    storage_name: "1_cat.png".to_string(),
                    size: 1024,
                    hash: "abc123".to_string(),
                    content_type: "image/png".to_string(),
                },
            )
            .await
            .unwrap();
        let rec = store.get_object(1).await.unwrap().unwrap();
        assert_eq!(rec.status, ObjectStatus::Complete);
        assert_eq!(rec.size, 1024);
        assert_eq!(rec.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_dedup_lookup_only_matches_complete() {
        let store = store();
        let mut pending = object(1, "image", "a.png");
        pending.hash = "samehash".to_string();
        store.insert_objects(vec![pending]).await.unwrap();

        // An uploading record must not satisfy the dedup probe.
        assert!(store
            .find_complete_by_hash("samehash")
            .await
            .unwrap()
            .is_none());

        store
            .finalize_object(
                1,
                FinalizeObject {
                    storage_name: "1_a.png".to_string(),
                    size: 10,
                    hash: "samehash".to_string(),
                    content_type: "image/png".to_string(),
                },
            )
            .await
            .unwrap();
        let hit = store.find_complete_by_hash("samehash").await.unwrap();
        assert_eq!(hit.unwrap().uid, 1);

        // Empty hashes never match anything.
        assert!(store.find_complete_by_hash("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alias_copies_storage_location() {
        let store = store();
        store
            .insert_objects(vec![object(1, "image", "a.png"), object(2, "doc", "b.png")])
            .await
            .unwrap();
        store
            .finalize_object(
                1,
                FinalizeObject {
                    storage_name: "1_a.png".to_string(),
                    size: 99,
                    hash: "h1".to_string(),
                    content_type: "image/png".to_string(),
                },
            )
            .await
            .unwrap();

        store.alias_object(2, 1).await.unwrap();
        let alias = store.get_object(2).await.unwrap().unwrap();
        assert_eq!(alias.status, ObjectStatus::Complete);
        assert_eq!(alias.storage_name, "1_a.png");
        assert_eq!(alias.bucket, "image");
        assert_eq!(alias.size, 99);
        // Display name stays the alias's own.
        assert_eq!(alias.name, "b.png");

        assert!(store.alias_object(2, 404).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_dedup_probe() {
        let store = store();
        let mut a = object(1, "image", "a.png");
        a.hash = "h-a".to_string();
        store.insert_objects(vec![a]).await.unwrap();
        store
            .finalize_object(
                1,
                FinalizeObject {
                    storage_name: "1_a.png".to_string(),
                    size: 5,
                    hash: "h-a".to_string(),
                    content_type: "image/png".to_string(),
                },
            )
            .await
            .unwrap();

        let found = store
            .find_complete_by_hashes(&["h-a".to_string(), "h-missing".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["h-a"].uid, 1);
    }

    #[tokio::test]
    async fn test_chunk_rows_unique_and_ordered() {
        let store = store();
        for idx in [2i64, 0, 1] {
            store
                .insert_chunk(ChunkRecord {
                    uid: 7,
                    chunk_index: idx,
                    bucket: "video".to_string(),
                    storage_name: format!("7_{idx}"),
                    size: 100,
                    hash: format!("hash{idx}"),
                    created_at: now_ts(),
                })
                .await
                .unwrap();
        }
        // Duplicate (uid, index) is rejected by the unique constraint.
        assert!(store
            .insert_chunk(ChunkRecord {
                uid: 7,
                chunk_index: 0,
                bucket: "video".to_string(),
                storage_name: "7_0".to_string(),
                size: 100,
                hash: "hash0".to_string(),
                created_at: now_ts(),
            })
            .await
            .is_err());

        assert_eq!(store.count_chunks(7).await.unwrap(), 3);
        let chunks = store.list_chunks(7).await.unwrap();
        let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        store.delete_chunks(7).await.unwrap();
        assert_eq!(store.count_chunks(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_task_single_winner() {
        let store = store();
        store.insert_task(100, "merge", "{}").await.unwrap();

        assert!(store.claim_task(100, "node-a").await.unwrap());
        // Second claim loses: the task is no longer pending.
        assert!(!store.claim_task(100, "node-b").await.unwrap());

        let task = store.get_task(100).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.node, "node-a");
    }

    #[tokio::test]
    async fn test_requeue_clears_owner_and_counts() {
        let store = store();
        store.insert_task(100, "merge", "{}").await.unwrap();
        store.claim_task(100, "node-a").await.unwrap();
        store.requeue_task(100).await.unwrap();

        let task = store.get_task(100).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.node, "");
        assert_eq!(task.execute_count, 1);

        // Requeued tasks are claimable again, by any node.
        assert!(store.claim_task(100, "node-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_node_tasks_on_shutdown() {
        let store = store();
        store.insert_task(1, "merge", "{}").await.unwrap();
        store.insert_task(2, "cleanup", "{}").await.unwrap();
        store.insert_task(3, "merge", "{}").await.unwrap();
        store.claim_task(1, "node-a").await.unwrap();
        store.claim_task(2, "node-a").await.unwrap();
        store.claim_task(3, "node-b").await.unwrap();

        let reset = store.reset_node_tasks("node-a").await.unwrap();
        assert_eq!(reset, 2);

        // Another node's running task is untouched.
        let other = store.get_task(3).await.unwrap().unwrap();
        assert_eq!(other.status, TaskStatus::Running);
        let pending = store.list_tasks_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|t| t.node.is_empty()));
    }

    #[tokio::test]
    async fn test_task_logs_append_only() {
        let store = store();
        store.insert_task(5, "merge", "{}").await.unwrap();
        let log1 = store
            .insert_task_log(5, TaskStatus::Running)
            .await
            .unwrap();
        store
            .update_task_log(log1, TaskStatus::Failed, "hash mismatch")
            .await
            .unwrap();
        let log2 = store
            .insert_task_log(5, TaskStatus::Running)
            .await
            .unwrap();
        store
            .update_task_log(log2, TaskStatus::Done, "")
            .await
            .unwrap();
        store.set_task_log(5, log2).await.unwrap();

        let logs = store.list_task_logs(5).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, TaskStatus::Failed);
        assert_eq!(logs[0].error_info, "hash mismatch");
        assert_eq!(logs[1].status, TaskStatus::Done);

        let task = store.get_task(5).await.unwrap().unwrap();
        assert_eq!(task.task_log_id, log2);
    }

    #[tokio::test]
    async fn test_segment_windows_never_overlap() {
        let store = store();
        store.seed_segment("task", 1000).await.unwrap();
        // Seeding again is a no-op.
        store.seed_segment("task", 50).await.unwrap();

        let first = store.claim_segment("task").await.unwrap();
        let second = store.claim_segment("task").await.unwrap();
        assert_eq!(first, IdRange { start: 1, end: 1000 });
        assert_eq!(second, IdRange { start: 1001, end: 2000 });
    }
}
