//! Sync error taxonomy
//!
//! Auth failures never leave the token broker as errors callers must
//! handle; they degrade to the `Offline` state. Remote failures abort the
//! current step and leave local data untouched.

use thiserror::Error;

use crate::storage::StorageError;

/// Identity provider failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The user or provider refused the grant
    #[error("Access was denied by the identity provider")]
    Denied,

    /// Silent renewal is impossible without a new consent step
    #[error("Sign-in requires user interaction")]
    InteractionRequired,

    /// The grant or device code expired before completion
    #[error("The sign-in request expired")]
    Expired,

    /// Provider could not be initialized (e.g. missing client id)
    #[error("Identity provider is not available: {0}")]
    Unavailable(String),

    /// Transport failure talking to the provider
    #[error("Identity provider unreachable: {0}")]
    Network(String),

    /// Any other provider-reported failure
    #[error("Identity provider error: {0}")]
    Provider(String),
}

/// Remote object store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The file id no longer resolves
    #[error("Remote file not found")]
    NotFound,

    /// The file exists but this credential may not touch it
    #[error("Access to the remote file is forbidden")]
    Forbidden,

    /// The bearer token was rejected
    #[error("Remote store rejected the access token")]
    Unauthorized,

    /// Any other non-success status
    #[error("Remote store returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Transport failure
    #[error("Network error: {0}")]
    Network(String),
}

impl RemoteError {
    /// Errors meaning the cached handle is stale and a create may succeed
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, RemoteError::NotFound | RemoteError::Forbidden)
    }
}

/// Errors surfaced by a sync or save step
#[derive(Error, Debug)]
pub enum SyncError {
    /// The session was cleared or superseded while the step was running
    #[error("Session ended before the operation completed")]
    SessionEnded,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Remote content is not a record array
    #[error("Remote file is not a valid record set: {0}")]
    Parse(String),

    /// Records could not be encoded for upload
    #[error("Failed to encode records: {0}")]
    Encode(String),

    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
