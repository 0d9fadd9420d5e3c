//! Background merge/cleanup tasks.
//!
//! Task handlers are looked up through an explicit [`HandlerTable`]
//! built once at startup and injected into the engine, never through
//! global registration.  [`engine::Engine`] runs the producer and
//! worker pool; [`merge`] and [`cleanup`] are the two handlers.

pub mod cleanup;
pub mod engine;
pub mod merge;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metadata::TaskRecord;

/// Task type tag for chunk merging.
pub const KIND_MERGE: &str = "merge";
/// Task type tag for staged-chunk cleanup.
pub const KIND_CLEANUP: &str = "cleanup";

/// Payload of a merge task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePayload {
    pub uid: i64,
    /// Declared chunk total the stored set must match.
    pub chunk_total: i64,
}

/// Payload of a cleanup task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPayload {
    pub uid: i64,
}

/// A task-type capability: a claim pre-check plus the execution body.
pub trait TaskHandler: Send + Sync + 'static {
    /// Whether this node should claim the task at all.  A merge task,
    /// for example, is only claimable by the node holding the staging
    /// directory; returning false leaves the task pending for the owner.
    fn pre_check(
        &self,
        task: &TaskRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Execute the task.  An error counts against the retry budget.
    fn run(
        &self,
        task: &TaskRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Explicit task-type to handler mapping, built once at startup.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: &'static str, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(kind)
    }
}
