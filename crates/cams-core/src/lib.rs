//! CAMS Core Library
//!
//! This crate provides the core functionality for CAMS, a local-first
//! catalog of actor profiles that optionally syncs with a single JSON file
//! in the user's cloud drive.
//!
//! # Architecture
//!
//! - **Local store**: Source of truth; every edit lands here first
//! - **Remote file**: One record array in an app-private folder, merged
//!   into the local catalog on connect and rewritten after edits
//!
//! # Quick Start
//!
//! ```text
//! let catalog = Catalog::open(&config)?;
//!
//! // Add a record
//! let mut record = Record::new("Yang Mi", "杨幂");
//! record.add_tag("drama");
//! let records = catalog.add(record)?;
//!
//! // Push it to the remote file if connected
//! sync.schedule_save(records);
//! ```
//!
//! # Modules
//!
//! - `catalog`: Record operations over local storage (main entry point)
//! - `models`: Records and record sets
//! - `storage`: Local key-value persistence
//! - `sync`: Token broker, remote client, merge, save scheduling
//! - `drive`: Google Drive and Google OAuth adapters
//! - `config`: Application configuration

pub mod catalog;
pub mod config;
pub mod drive;
pub mod models;
pub mod storage;
pub mod sync;

pub use catalog::Catalog;
pub use config::Config;
pub use models::{phonetic_key, Record, RecordId, RecordSet};
pub use storage::{FileStore, LocalKey, LocalStore, MemoryStore, StorageError};
pub use sync::{SyncEvent, SyncOrchestrator, SyncSettings, SyncState};
