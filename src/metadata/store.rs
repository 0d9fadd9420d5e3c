//! Abstract metadata store trait.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses manually-desugared async methods (pinned futures) so it can be
//! used with both SQLite and future remote stores.  The metadata store
//! is the single source of truth; every write is row-scoped so
//! concurrent writers cannot touch unrelated rows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

// ── Status types ────────────────────────────────────────────────────

/// Lifecycle of an object record: created `pending` at link issuance,
/// `uploading` once bytes start arriving, `complete` after single-shot
/// finalization or merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Pending,
    Uploading,
    Complete,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Pending => "pending",
            ObjectStatus::Uploading => "uploading",
            ObjectStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(ObjectStatus::Pending),
            "uploading" => Ok(ObjectStatus::Uploading),
            "complete" => Ok(ObjectStatus::Complete),
            other => anyhow::bail!("unknown object status: {other}"),
        }
    }
}

/// Lifecycle of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => anyhow::bail!("unknown task status: {other}"),
        }
    }
}

// ── Record types ────────────────────────────────────────────────────

/// Metadata record for one logical uploaded object.
///
/// Serializable so it can be published to the shared cache as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Globally unique, time-ordered id.
    pub uid: i64,
    /// Bucket the object belongs to (chosen by file suffix).
    pub bucket: String,
    /// Original display name.
    pub name: String,
    /// Name under which the bytes are stored in the backend.
    pub storage_name: String,
    /// Address of the node that issued the upload link.
    pub address: String,
    /// Hex content hash of the full object.
    pub hash: String,
    /// Object size in bytes.
    pub size: i64,
    /// Whether this object was uploaded in chunks.
    pub chunked: bool,
    /// Declared chunk total for chunked uploads.
    pub chunk_count: i64,
    /// Lifecycle state.
    pub status: ObjectStatus,
    /// MIME type sniffed at finalization.
    pub content_type: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// ISO-8601 last-update timestamp.
    pub updated_at: String,
}

/// Fields written when an object reaches `complete`.
#[derive(Debug, Clone)]
pub struct FinalizeObject {
    pub storage_name: String,
    pub size: i64,
    pub hash: String,
    pub content_type: String,
}

/// Metadata record for one accepted chunk of a chunked upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Parent object uid.
    pub uid: i64,
    /// Zero-based chunk index.
    pub chunk_index: i64,
    /// Bucket the chunk object lives in.
    pub bucket: String,
    /// Backend storage name of the chunk object.
    pub storage_name: String,
    /// Chunk size in bytes.
    pub size: i64,
    /// Hex content hash of the chunk.
    pub hash: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

/// A background merge or cleanup task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub status: TaskStatus,
    /// Task type tag, e.g. `merge` or `cleanup`.
    pub kind: String,
    /// Opaque JSON payload interpreted by the handler.
    pub payload: String,
    /// Node that currently owns the task; empty when unowned.
    pub node: String,
    /// Latest task-log row id, 0 when none yet.
    pub task_log_id: i64,
    /// Number of execution attempts so far.
    pub execute_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// One execution attempt of a task.  Rows are append-only.
#[derive(Debug, Clone)]
pub struct TaskLogRecord {
    pub id: i64,
    pub task_id: i64,
    pub status: TaskStatus,
    pub error_info: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A claimed, non-overlapping id window: ids `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata store contract.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Objects ─────────────────────────────────────────────────────

    /// Insert a batch of fresh object records (link issuance).
    fn insert_objects(
        &self,
        records: Vec<ObjectRecord>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get a single object record by uid.
    fn get_object(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>>;

    /// Find a `complete` object with the given content hash, if any.
    /// Used for the dedup check before a physical upload.
    fn find_complete_by_hash(
        &self,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>>;

    /// Batch form of [`Self::find_complete_by_hash`] keyed by hash.
    fn find_complete_by_hashes(
        &self,
        hashes: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, ObjectRecord>>> + Send + '_>>;

    /// Transition an object to `uploading`.
    fn mark_uploading(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Record the declared chunk total and size on a chunked object
    /// awaiting merge.  Status stays `uploading` until the merge task
    /// finalizes it.
    fn set_chunked(
        &self,
        uid: i64,
        chunk_count: i64,
        size: i64,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Transition an object to `complete` with its final storage fields.
    fn finalize_object(
        &self,
        uid: i64,
        fields: FinalizeObject,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Make `uid` an alias of `src`: copy the source's storage location
    /// and mark the alias `complete` without a physical upload.
    fn alias_object(
        &self,
        uid: i64,
        src_uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete one object's metadata row.  Physical storage shared with
    /// other aliases is never touched here.
    fn delete_object_meta(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    // ── Chunks ──────────────────────────────────────────────────────

    /// Insert one accepted chunk row.
    fn insert_chunk(
        &self,
        record: ChunkRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get one chunk by parent uid and index.
    fn get_chunk(
        &self,
        uid: i64,
        chunk_index: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ChunkRecord>>> + Send + '_>>;

    /// List all chunks of an object ordered by index.
    fn list_chunks(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ChunkRecord>>> + Send + '_>>;

    /// Count stored chunks of an object.
    fn count_chunks(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>>;

    /// Delete all chunk rows of an object.
    fn delete_chunks(
        &self,
        uid: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new `pending` task, returning its id.
    fn insert_task(
        &self,
        id: i64,
        kind: &str,
        payload: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get a task by id.
    fn get_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<TaskRecord>>> + Send + '_>>;

    /// List tasks in a given state, oldest first.
    fn list_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<TaskRecord>>> + Send + '_>>;

    /// Atomically claim a `pending` task for `node`, moving it to
    /// `running`.  Returns whether this caller won the claim; the
    /// conditional update linearizes racing claimers.
    fn claim_task(
        &self,
        id: i64,
        node: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Mark a task `done`, incrementing its execution counter.
    fn finish_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Return a failed task to `pending` with owner cleared and the
    /// execution counter incremented, so any node can retry it.
    fn requeue_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Mark a task permanently `failed`, incrementing its counter.
    fn fail_task(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Reset all `running` tasks owned by `node` back to `pending` with
    /// owner cleared.  Called on ordered shutdown so no task is lost.
    /// Returns the number of tasks reset.
    fn reset_node_tasks(
        &self,
        node: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>>;

    /// Point a task at its latest log row.
    fn set_task_log(
        &self,
        id: i64,
        log_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    // ── Task logs ───────────────────────────────────────────────────

    /// Append a new task-log row, returning its id.
    fn insert_task_log(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<i64>> + Send + '_>>;

    /// Update the status and error text of an existing log row.
    fn update_task_log(
        &self,
        log_id: i64,
        status: TaskStatus,
        error_info: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List all log rows of a task, oldest first.
    fn list_task_logs(
        &self,
        task_id: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<TaskLogRecord>>> + Send + '_>>;

    // ── Id segments ─────────────────────────────────────────────────

    /// Ensure a segment row exists for `business_id` with the given step.
    fn seed_segment(
        &self,
        business_id: &str,
        step: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Transactionally advance the segment row and return the freshly
    /// claimed id window.  Serialization on the row guarantees two
    /// allocator instances never receive overlapping windows.
    fn claim_segment(
        &self,
        business_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<IdRange>> + Send + '_>>;
}

/// Current UTC timestamp in the format stored in metadata rows.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}
