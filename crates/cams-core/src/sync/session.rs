//! Authenticated session state
//!
//! The session is an explicit object owned by the orchestrator and handed
//! to the token broker, remote client and save scheduler. Every piece of
//! remote work is stamped with the session generation it started under;
//! the generation moves forward on disconnect, on credential loss and
//! whenever a merge replaces the local catalog, so work started before
//! any of those is recognised as stale and dropped.
//!
//! Token requests are stamped separately with the session epoch, which
//! moves only when the credential is dropped. A token that arrives after
//! a disconnect belongs to an older epoch and is never installed.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::error::{SyncError, SyncResult};

/// Opaque bearer credential
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// The bearer string attached to remote calls
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// When the provider said the token stops working
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Snapshot of the session
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    pub access_token: Option<AccessToken>,
    pub connected: bool,
    pub generation: u64,
    /// Bumped each time the credential is dropped
    pub epoch: u64,
}

/// Shared handle to the session
///
/// Cloning the handle shares the same underlying state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<watch::Sender<AuthSession>>,
}

impl Session {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AuthSession::default());
        Self {
            inner: Arc::new(tx),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> AuthSession {
        self.inner.borrow().clone()
    }

    /// Watch session changes
    pub fn subscribe(&self) -> watch::Receiver<AuthSession> {
        self.inner.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    pub fn generation(&self) -> u64 {
        self.inner.borrow().generation
    }

    pub fn epoch(&self) -> u64 {
        self.inner.borrow().epoch
    }

    /// Epoch of the live credential, `None` when not connected
    pub(crate) fn connected_epoch(&self) -> Option<u64> {
        let session = self.inner.borrow();
        session.connected.then_some(session.epoch)
    }

    /// Generation to stamp new work with, `None` when not connected
    pub fn current_generation(&self) -> Option<u64> {
        let session = self.inner.borrow();
        session.connected.then_some(session.generation)
    }

    /// Bearer string for work stamped with `generation`
    ///
    /// Fails with `SessionEnded` if the session was cleared or advanced
    /// since the work was stamped.
    pub fn bearer_for(&self, generation: u64) -> SyncResult<String> {
        let session = self.inner.borrow();
        match (&session.access_token, session.connected) {
            (Some(token), true) if session.generation == generation => {
                Ok(token.secret().to_string())
            }
            _ => Err(SyncError::SessionEnded),
        }
    }

    /// Fail unless work stamped with `generation` is still current
    pub fn ensure_current(&self, generation: u64) -> SyncResult<()> {
        self.bearer_for(generation).map(|_| ())
    }

    /// Install a token requested during `epoch`
    ///
    /// Returns false, leaving the session untouched, if the credential was
    /// dropped since the request started. Renewal keeps the generation:
    /// work in flight stays valid.
    pub(crate) fn establish_if(&self, epoch: u64, token: AccessToken) -> bool {
        self.inner.send_if_modified(|session| {
            if session.epoch != epoch {
                return false;
            }
            session.access_token = Some(token);
            session.connected = true;
            true
        })
    }

    #[cfg(test)]
    pub(crate) fn establish(&self, token: AccessToken) {
        self.establish_if(self.epoch(), token);
    }

    /// Drop the credential and invalidate all outstanding work
    pub(crate) fn clear(&self) -> Option<AccessToken> {
        let mut previous = None;
        self.inner.send_modify(|session| {
            previous = session.access_token.take();
            session.connected = false;
            session.generation += 1;
            session.epoch += 1;
        });
        previous
    }

    /// Like `clear`, but only while the credential from `epoch` is live
    pub(crate) fn clear_if(&self, epoch: u64) -> bool {
        self.inner.send_if_modified(|session| {
            if !session.connected || session.epoch != epoch {
                return false;
            }
            session.access_token = None;
            session.connected = false;
            session.generation += 1;
            session.epoch += 1;
            true
        })
    }

    /// Invalidate outstanding work while keeping the credential
    pub(crate) fn advance(&self) -> u64 {
        let mut generation = 0;
        self.inner.send_modify(|session| {
            session.generation += 1;
            generation = session.generation;
        });
        generation
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Session").field(&*self.inner.borrow()).finish()
    }
}
