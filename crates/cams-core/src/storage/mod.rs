//! Storage layer
//!
//! Local persistence for the catalog and the sync bookkeeping values.
//! The device copy is the source of truth; remote data only replaces it
//! through an explicit merge.

pub mod error;
pub mod persistence;

pub use error::{StorageError, StorageResult};
pub use persistence::{FileStore, LocalKey, LocalStore, MemoryStore};
