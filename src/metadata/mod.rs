//! Metadata persistence layer.
//!
//! [`store::MetadataStore`] defines the contract; [`sqlite`] provides
//! the SQLite-backed implementation used in production and tests.

pub mod sqlite;
pub mod store;

pub use store::{
    ChunkRecord, FinalizeObject, IdRange, MetadataStore, ObjectRecord, ObjectStatus, TaskRecord,
    TaskStatus,
};
