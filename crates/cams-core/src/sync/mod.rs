//! Sync with a single remote file
//!
//! Keeps the local catalog and one JSON file in the app-private folder of
//! an OAuth-protected object store in agreement.
//!
//! ## Flow
//!
//! 1. Obtain a token (silently at startup if previously connected, or
//!    interactively on connect)
//! 2. Locate and read the remote file
//! 3. Merge it into the local catalog (newer recency marker wins)
//! 4. Persist locally, then write the merged set back
//! 5. After local edits, save again through a debounced scheduler
//!
//! ## Usage
//!
//! ```ignore
//! let sync = SyncOrchestrator::new(identity, drive, local, SyncSettings::from_config(&config));
//! sync.start().await;
//! sync.schedule_save(catalog.records()?);
//! sync.flush().await;
//! ```

mod error;
mod merge;
mod orchestrator;
mod remote;
mod scheduler;
mod session;
mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AuthError, RemoteError, SyncError, SyncResult};
pub use merge::{merge, merge_with_stats, MergeStats};
pub use orchestrator::{SyncEvent, SyncOrchestrator, SyncSettings, SyncState};
pub use remote::{RemoteFileHandle, RemoteStore, RemoteStoreClient};
pub use scheduler::{CoalescingScheduler, SaveScheduler, SchedulerConfig};
pub use session::{AccessToken, AuthSession, Session};
pub use token::{IdentityProvider, IssuedToken, TokenBroker, TokenEvent, TokenMode, TokenSource};
