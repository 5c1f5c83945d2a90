//! Local key-value persistence
//!
//! The catalog keeps a handful of values on the device: the record set,
//! the "previously connected" marker, the identity hint and the identity
//! provider's grant. `FileStore` keeps one file per key and writes them
//! atomically (temp file, fsync, rename); `MemoryStore` is the in-process
//! equivalent.
//!
//! Storage location: `~/.local/share/cams/` (configurable via `Config`)

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::RecordSet;

use super::error::{StorageError, StorageResult};

/// Keys of the values kept in local persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKey {
    /// The catalog, a JSON record array
    Records,
    /// Present when the last session ended connected
    Connected,
    /// Account hint for silent token requests
    UserHint,
    /// Identity provider grant (opaque to the core)
    Grant,
}

impl LocalKey {
    /// Stable name, also used as the file name
    pub fn name(&self) -> &'static str {
        match self {
            LocalKey::Records => "records.json",
            LocalKey::Connected => "drive_connected",
            LocalKey::UserHint => "user_hint",
            LocalKey::Grant => "oauth_grant.json",
        }
    }
}

/// Local persistence collaborator
pub trait LocalStore: Send + Sync {
    /// Read a value, `None` when never set
    fn get(&self, key: LocalKey) -> StorageResult<Option<String>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: LocalKey, value: &str) -> StorageResult<()>;

    /// Delete a value; deleting a missing key is not an error
    fn remove(&self, key: LocalKey) -> StorageResult<()>;

    /// Load the catalog (empty when nothing is stored yet)
    fn load_records(&self) -> StorageResult<RecordSet> {
        match self.get(LocalKey::Records)? {
            None => Ok(RecordSet::new()),
            Some(json) if json.trim().is_empty() => Ok(RecordSet::new()),
            Some(json) => {
                RecordSet::from_json(json.as_bytes()).map_err(|e| StorageError::InvalidFormat {
                    key: LocalKey::Records.name(),
                    details: e.to_string(),
                })
            }
        }
    }

    /// Replace the stored catalog wholesale
    fn save_records(&self, records: &RecordSet) -> StorageResult<()> {
        let json = serde_json::to_string(records).map_err(|source| StorageError::Serialize {
            key: LocalKey::Records.name(),
            source,
        })?;
        self.set(LocalKey::Records, &json)
    }

    /// Whether the previous session ended connected
    fn was_connected(&self) -> StorageResult<bool> {
        Ok(self.get(LocalKey::Connected)?.is_some())
    }

    /// Set or clear the "previously connected" marker
    fn set_connected(&self, connected: bool) -> StorageResult<()> {
        if connected {
            self.set(LocalKey::Connected, "1")
        } else {
            self.remove(LocalKey::Connected)
        }
    }
}

/// File-backed store: one file per key inside the data directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir` (created lazily on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing a key
    pub fn path_for(&self, key: LocalKey) -> PathBuf {
        self.dir.join(key.name())
    }

    /// Size in bytes of the stored catalog, if any
    pub fn records_size(&self) -> Option<u64> {
        fs::metadata(self.path_for(LocalKey::Records))
            .ok()
            .map(|m| m.len())
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: LocalKey) -> StorageResult<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::ReadError { path, source }),
        }
    }

    fn set(&self, key: LocalKey, value: &str) -> StorageResult<()> {
        // The grant holds a refresh token
        let private = key == LocalKey::Grant;
        atomic_write(&self.path_for(key), value.as_bytes(), private)
    }

    fn remove(&self, key: LocalKey) -> StorageResult<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, path)),
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<LocalKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<LocalKey, String>> {
        // A poisoned map is still a valid map
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: LocalKey) -> StorageResult<Option<String>> {
        Ok(self.values().get(&key).cloned())
    }

    fn set(&self, key: LocalKey, value: &str) -> StorageResult<()> {
        self.values().insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: LocalKey) -> StorageResult<()> {
        self.values().remove(&key);
        Ok(())
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
///
/// `private` files are created readable by the owner only (unix).
fn atomic_write(path: &Path, data: &[u8], private: bool) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = create_temp(&temp_path, private)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::AtomicWriteFailed {
        from: temp_path,
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

fn create_temp(path: &Path, private: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        if private {
            // The mode only applies on creation, so never reuse a leftover temp file
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    options.open(path)
}
