//! Object storage facade.
//!
//! [`backend::ObjectStore`] is the contract every backend implements;
//! [`local`] stores objects on the local filesystem and [`memory`]
//! keeps them in a map for tests.

pub mod backend;
pub mod local;
pub mod memory;

pub use backend::ObjectStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
