//! Token broker
//!
//! Wraps the identity provider. Silent requests never prompt and degrade
//! to "no token" on failure; interactive requests may show a consent step
//! and report failures. Every issued token is installed in the session and
//! announced on a broadcast channel tagged with where it came from, so the
//! orchestrator can tell a background renewal apart from a token it asked
//! for itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::AuthError;
use super::session::{AccessToken, Session};
use crate::storage::{LocalKey, LocalStore};

/// Never schedule renewals closer together than this
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(5);

/// How a token request may interact with the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    /// No UI; fails if consent would be needed
    Silent,
    /// May show a consent step
    Interactive,
}

/// A token as issued by the provider
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: AccessToken,
    /// Account identity to remember for later silent requests
    pub hint: Option<String>,
}

/// Identity provider collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Load whatever the provider needs before tokens can be requested
    async fn init(&self) -> Result<(), AuthError>;

    /// Request an access token, optionally for a known account
    async fn request_token(
        &self,
        mode: TokenMode,
        hint: Option<&str>,
    ) -> Result<IssuedToken, AuthError>;

    /// Revoke a token previously issued
    async fn revoke(&self, token: &AccessToken) -> Result<(), AuthError>;

    /// Drop any long-lived credential kept for silent requests
    ///
    /// Called on disconnect whether or not an access token is held.
    async fn forget(&self) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Where a token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Returned to a caller of `request_token`
    Request,
    /// Obtained by the background renewal loop
    Renewal,
}

/// Broker notifications
#[derive(Debug, Clone)]
pub enum TokenEvent {
    Issued { token: AccessToken, source: TokenSource },
    /// Background renewal failed and the session was cleared
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// Token broker
pub struct TokenBroker {
    provider: Arc<dyn IdentityProvider>,
    session: Session,
    local: Arc<dyn LocalStore>,
    ready: watch::Sender<Readiness>,
    init_lock: Mutex<()>,
    events: broadcast::Sender<TokenEvent>,
    renew_margin: Duration,
}

impl TokenBroker {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        session: Session,
        local: Arc<dyn LocalStore>,
        renew_margin: Duration,
    ) -> Self {
        let (ready, _) = watch::channel(Readiness::Pending);
        let (events, _) = broadcast::channel(16);
        Self {
            provider,
            session,
            local,
            ready,
            init_lock: Mutex::new(()),
            events,
            renew_margin,
        }
    }

    /// Initialize the provider and signal readiness
    ///
    /// Token requests wait for this to finish. A failed initialization
    /// can be retried by calling this again.
    pub async fn initialize(&self) -> bool {
        let _guard = self.init_lock.lock().await;
        if *self.ready.borrow() == Readiness::Ready {
            return true;
        }

        match self.provider.init().await {
            Ok(()) => {
                debug!("Identity provider ready");
                self.ready.send_replace(Readiness::Ready);
                true
            }
            Err(e) => {
                warn!(error = %e, "Identity provider failed to initialize");
                self.ready.send_replace(Readiness::Failed);
                false
            }
        }
    }

    /// Whether the provider initialized successfully
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == Readiness::Ready
    }

    async fn wait_ready(&self) -> bool {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|r| *r != Readiness::Pending)
            .await
            .map(|r| *r == Readiness::Ready)
            .unwrap_or(false)
    }

    /// Subscribe to token notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    /// Request an access token
    ///
    /// Silent mode returns `Ok(None)` instead of failing. Interactive mode
    /// reports the failure. Either way a failure leaves the session as it
    /// was. A token issued after a concurrent `revoke` is discarded and
    /// also yields `Ok(None)`.
    pub async fn request_token(&self, mode: TokenMode) -> Result<Option<AccessToken>, AuthError> {
        if !self.wait_ready().await {
            return match mode {
                TokenMode::Silent => Ok(None),
                TokenMode::Interactive => Err(AuthError::Unavailable(
                    "identity provider failed to initialize".to_string(),
                )),
            };
        }

        let epoch = self.session.epoch();
        let hint = self.stored_hint();
        match self.provider.request_token(mode, hint.as_deref()).await {
            Ok(issued) => Ok(self.accept(epoch, issued, TokenSource::Request).await),
            Err(e) => match mode {
                TokenMode::Silent => {
                    debug!(error = %e, "Silent token request failed");
                    Ok(None)
                }
                TokenMode::Interactive => {
                    warn!(error = %e, "Interactive token request failed");
                    Err(e)
                }
            },
        }
    }

    /// Revoke the current token, clear the session and forget the grant
    ///
    /// The provider is asked to forget its stored credential even when no
    /// access token is held. Provider errors are logged; the session is
    /// cleared regardless.
    pub async fn revoke(&self) {
        match self.session.clear() {
            Some(token) => match self.provider.revoke(&token).await {
                Ok(()) => info!("Access token revoked"),
                Err(e) => warn!(error = %e, "Failed to revoke access token"),
            },
            None => debug!("No access token to revoke"),
        }

        if let Err(e) = self.provider.forget().await {
            warn!(error = %e, "Failed to forget stored credential");
        }
    }

    /// Silently renew the current token
    ///
    /// On failure the session is cleared and `Lost` is announced. A renewal
    /// overtaken by a disconnect changes nothing.
    pub async fn renew(&self) -> bool {
        let Some(epoch) = self.session.connected_epoch() else {
            debug!("Not connected, skipping renewal");
            return false;
        };

        let hint = self.stored_hint();
        match self
            .provider
            .request_token(TokenMode::Silent, hint.as_deref())
            .await
        {
            Ok(issued) => self
                .accept(epoch, issued, TokenSource::Renewal)
                .await
                .is_some(),
            Err(e) => {
                if self.session.clear_if(epoch) {
                    warn!(error = %e, "Token renewal failed, session lost");
                    let _ = self.events.send(TokenEvent::Lost);
                } else {
                    debug!(error = %e, "Renewal failed after the session ended");
                }
                false
            }
        }
    }

    /// Keep the session token fresh in the background
    ///
    /// Sleeps until `renew_margin` before the current token expires, then
    /// renews it. Tokens without an expiry are never renewed.
    pub fn spawn_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::downgrade(self);
        let mut session_rx = self.session.subscribe();
        let margin = self.renew_margin;

        tokio::spawn(async move {
            loop {
                let expires_at = session_rx
                    .borrow_and_update()
                    .access_token
                    .as_ref()
                    .and_then(AccessToken::expires_at);

                let Some(expires_at) = expires_at else {
                    if session_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                };

                let delay = renewal_delay(expires_at, margin, Utc::now());
                debug!(?delay, "Token renewal scheduled");
                tokio::select! {
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                let Some(broker) = broker.upgrade() else {
                    break;
                };
                broker.renew().await;
            }
            debug!("Token renewal loop stopped");
        })
    }

    /// Install a token requested during `epoch` and announce it
    ///
    /// A token whose epoch has ended is revoked and dropped.
    async fn accept(
        &self,
        epoch: u64,
        issued: IssuedToken,
        source: TokenSource,
    ) -> Option<AccessToken> {
        if !self.session.establish_if(epoch, issued.token.clone()) {
            info!(?source, "Discarding token issued after disconnect");
            if let Err(e) = self.provider.revoke(&issued.token).await {
                debug!(error = %e, "Failed to revoke discarded token");
            }
            return None;
        }

        if let Some(hint) = issued.hint.as_deref() {
            if let Err(e) = self.local.set(LocalKey::UserHint, hint) {
                warn!(error = %e, "Failed to store account hint");
            }
        }

        debug!(?source, expires_at = ?issued.token.expires_at(), "Access token issued");
        let _ = self.events.send(TokenEvent::Issued {
            token: issued.token.clone(),
            source,
        });
        Some(issued.token)
    }

    fn stored_hint(&self) -> Option<String> {
        match self.local.get(LocalKey::UserHint) {
            Ok(hint) => hint.filter(|h| !h.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read account hint");
                None
            }
        }
    }
}

/// Time to wait before renewing a token expiring at `expires_at`
fn renewal_delay(expires_at: DateTime<Utc>, margin: Duration, now: DateTime<Utc>) -> Duration {
    let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
    (expires_at - margin - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_RENEWAL_DELAY)
}
