//! Remote store client
//!
//! Locates, reads and writes the single catalog file in the app-private
//! folder of the remote object store. All writes go through one lock so
//! two saves never interleave, and every call is checked against the
//! session generation it was stamped with.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{RemoteError, SyncError, SyncResult};
use super::session::Session;
use crate::models::RecordSet;

/// Reference to a file in the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileHandle {
    pub id: String,
    pub name: String,
}

/// Object-store operations the client needs
///
/// `token` is the bearer credential for the call.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Files in the app folder whose name equals `name`
    async fn list_files(&self, token: &str, name: &str)
        -> Result<Vec<RemoteFileHandle>, RemoteError>;

    /// Raw file content
    async fn get_content(&self, token: &str, file_id: &str) -> Result<Vec<u8>, RemoteError>;

    /// Create a file in the app folder, returning its id
    async fn create_file(
        &self,
        token: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<String, RemoteError>;

    /// Replace the content of an existing file
    async fn update_content(
        &self,
        token: &str,
        file_id: &str,
        content: Vec<u8>,
    ) -> Result<(), RemoteError>;
}

/// Client for the catalog file
pub struct RemoteStoreClient {
    store: Arc<dyn RemoteStore>,
    session: Session,
    file_name: String,
    /// Last handle located or created
    handle: StdMutex<Option<RemoteFileHandle>>,
    /// Serializes writes
    write_lock: Mutex<()>,
}

impl RemoteStoreClient {
    pub fn new(store: Arc<dyn RemoteStore>, session: Session, file_name: impl Into<String>) -> Self {
        Self {
            store,
            session,
            file_name: file_name.into(),
            handle: StdMutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The handle from the last locate, create or successful write
    pub fn cached_handle(&self) -> Option<RemoteFileHandle> {
        self.handle_slot().clone()
    }

    /// Forget the cached handle so the next save locates again
    pub fn forget_handle(&self) {
        *self.handle_slot() = None;
    }

    fn handle_slot(&self) -> std::sync::MutexGuard<'_, Option<RemoteFileHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remember(&self, handle: &RemoteFileHandle) {
        *self.handle_slot() = Some(handle.clone());
    }

    /// Find the catalog file
    ///
    /// When several files share the name, the lexicographically smallest
    /// id wins so every device settles on the same file.
    pub async fn locate_file(&self, generation: u64) -> SyncResult<Option<RemoteFileHandle>> {
        let token = self.session.bearer_for(generation)?;
        let mut matches = self.store.list_files(&token, &self.file_name).await?;
        matches.retain(|f| f.name == self.file_name);

        if matches.len() > 1 {
            warn!(
                count = matches.len(),
                name = %self.file_name,
                "Multiple remote catalog files found, using the smallest id"
            );
        }

        let chosen = matches.into_iter().min_by(|a, b| a.id.cmp(&b.id));
        match &chosen {
            Some(handle) => {
                debug!(file_id = %handle.id, "Located remote catalog");
                self.remember(handle);
            }
            None => {
                debug!(name = %self.file_name, "No remote catalog yet");
                self.forget_handle();
            }
        }
        Ok(chosen)
    }

    /// Download and parse the catalog file
    ///
    /// `Remote(NotFound)` means the handle went stale; `Parse` means the
    /// content is not a record array.
    pub async fn read_file(
        &self,
        generation: u64,
        handle: &RemoteFileHandle,
    ) -> SyncResult<RecordSet> {
        let token = self.session.bearer_for(generation)?;
        let bytes = match self.store.get_content(&token, &handle.id).await {
            Ok(bytes) => bytes,
            Err(RemoteError::NotFound) => {
                self.forget_handle();
                return Err(RemoteError::NotFound.into());
            }
            Err(e) => return Err(e.into()),
        };

        RecordSet::from_json(&bytes).map_err(|e| SyncError::Parse(e.to_string()))
    }

    /// Write the full record set
    ///
    /// With a handle the content is replaced in place. If that fails
    /// because the handle is stale, the write is retried exactly once as a
    /// create with the same content. Without a handle a new file is
    /// created. Returns the handle that now holds the content.
    pub async fn write_file(
        &self,
        generation: u64,
        handle: Option<&RemoteFileHandle>,
        records: &RecordSet,
    ) -> SyncResult<RemoteFileHandle> {
        let _guard = self.write_lock.lock().await;
        self.write_locked(generation, handle, records).await
    }

    /// Save to the cached handle, locating the file first if none is known
    pub async fn save(&self, generation: u64, records: &RecordSet) -> SyncResult<RemoteFileHandle> {
        let _guard = self.write_lock.lock().await;
        let handle = match self.cached_handle() {
            Some(handle) => Some(handle),
            None => self.locate_file(generation).await?,
        };
        self.write_locked(generation, handle.as_ref(), records).await
    }

    async fn write_locked(
        &self,
        generation: u64,
        handle: Option<&RemoteFileHandle>,
        records: &RecordSet,
    ) -> SyncResult<RemoteFileHandle> {
        let content = records
            .to_json()
            .map_err(|e| SyncError::Encode(e.to_string()))?;

        if let Some(handle) = handle {
            let token = self.session.bearer_for(generation)?;
            match self
                .store
                .update_content(&token, &handle.id, content.clone())
                .await
            {
                Ok(()) => {
                    debug!(file_id = %handle.id, records = records.len(), "Updated remote catalog");
                    self.remember(handle);
                    return Ok(handle.clone());
                }
                Err(e) if e.is_stale_handle() => {
                    warn!(file_id = %handle.id, error = %e, "Remote handle is stale, creating a new file");
                    self.forget_handle();
                }
                Err(e) => return Err(e.into()),
            }
        }

        // The session may have ended while the update was in flight
        let token = self.session.bearer_for(generation)?;
        let file_id = self
            .store
            .create_file(&token, &self.file_name, content)
            .await?;
        let created = RemoteFileHandle {
            id: file_id,
            name: self.file_name.clone(),
        };
        info!(file_id = %created.id, records = records.len(), "Created remote catalog");
        self.remember(&created);
        Ok(created)
    }
}
