//! Sync orchestrator
//!
//! Drives the connection lifecycle: silent reconnect at startup, explicit
//! connect and disconnect, the sync pass run whenever a token arrives, and
//! remote saves after local edits.
//!
//! The sync pass reads the remote file, merges it into the local catalog,
//! persists the result locally, publishes it, then writes it back. If the
//! remote file is missing or unreadable the local catalog is uploaded
//! instead. Any failure leaves the local catalog as it was and drops to
//! `Offline`.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{RemoteError, SyncError, SyncResult};
use super::merge::{merge_with_stats, MergeStats};
use super::remote::{RemoteFileHandle, RemoteStore, RemoteStoreClient};
use super::scheduler::{SaveScheduler, SchedulerConfig};
use super::session::Session;
use super::token::{IdentityProvider, TokenBroker, TokenEvent, TokenMode, TokenSource};
use crate::config::Config;
use crate::models::RecordSet;
use crate::storage::{LocalKey, LocalStore};

/// Connection state as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not connected (never connected, disconnected, or a step failed)
    Offline,
    /// Waiting for a token
    Connecting,
    /// Sync pass in progress
    Syncing,
    /// Local and remote agree as of the last pass
    Synced,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Offline => "offline",
            SyncState::Connecting => "connecting",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection state changed
    StatusChanged(SyncState),
    /// The local catalog was replaced by a merge; re-render from this
    RecordsUpdated(RecordSet),
    /// A step failed
    Error(String),
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub remote_file_name: String,
    pub scheduler: SchedulerConfig,
    pub renew_margin: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_file_name: "data.json".to_string(),
            scheduler: SchedulerConfig::default(),
            renew_margin: Duration::from_secs(60),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            remote_file_name: config.remote_file_name.clone(),
            scheduler: SchedulerConfig {
                quiet_period: config.debounce(),
                cooldown: config.cooldown(),
            },
            renew_margin: config.renew_margin(),
        }
    }
}

/// What a successful sync pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Merged(MergeStats),
    Uploaded { records: usize },
}

/// Remote state fetched at the start of a pass
struct RemoteSnapshot {
    handle: Option<RemoteFileHandle>,
    /// `None` when the file is absent or unreadable
    records: Option<RecordSet>,
}

/// Sync orchestrator
pub struct SyncOrchestrator {
    session: Session,
    broker: Arc<TokenBroker>,
    remote: Arc<RemoteStoreClient>,
    scheduler: SaveScheduler,
    local: Arc<dyn LocalStore>,
    /// Current state
    status: watch::Sender<SyncState>,
    /// Event channel
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    /// Event receiver, handed out once
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    /// Held for the duration of a sync pass
    sync_guard: Mutex<()>,
    /// Renewal loop and token listener
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Wire up the sync components
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let session = Session::new();
        let broker = Arc::new(TokenBroker::new(
            provider,
            session.clone(),
            local.clone(),
            settings.renew_margin,
        ));
        let remote = Arc::new(RemoteStoreClient::new(
            store,
            session.clone(),
            settings.remote_file_name,
        ));
        let scheduler = SaveScheduler::spawn(settings.scheduler, remote.clone(), session.clone());
        let (status, _) = watch::channel(SyncState::Offline);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            session,
            broker,
            remote,
            scheduler,
            local,
            status,
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            sync_guard: Mutex::new(()),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Get the current state
    pub fn status(&self) -> SyncState {
        *self.status.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe_status(&self) -> watch::Receiver<SyncState> {
        self.status.subscribe()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// The session shared by all sync components
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Startup: initialize the provider and reconnect silently
    ///
    /// Only attempted when the previous session ended connected. Starts
    /// the background renewal loop on first call.
    pub async fn start(self: &Arc<Self>) -> SyncState {
        self.spawn_background();

        if !self.broker.initialize().await {
            return self.set_status(SyncState::Offline);
        }

        match self.local.was_connected() {
            Ok(true) => {}
            Ok(false) => {
                debug!("Not previously connected, staying offline");
                return self.set_status(SyncState::Offline);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read connection marker");
                return self.set_status(SyncState::Offline);
            }
        }

        self.set_status(SyncState::Connecting);
        match self.broker.request_token(TokenMode::Silent).await {
            Ok(Some(_)) => self.on_token().await,
            _ => {
                info!("Silent sign-in unavailable, staying offline");
                self.set_status(SyncState::Offline)
            }
        }
    }

    /// User-initiated connect: request a token interactively, then sync
    pub async fn connect(self: &Arc<Self>) -> SyncState {
        self.spawn_background();

        if !self.broker.initialize().await {
            self.emit(SyncEvent::Error(
                "Identity provider is not available".to_string(),
            ));
            return self.set_status(SyncState::Offline);
        }

        self.set_status(SyncState::Connecting);
        match self.broker.request_token(TokenMode::Interactive).await {
            Ok(Some(_)) => self.on_token().await,
            Ok(None) => self.set_status(SyncState::Offline),
            Err(e) => {
                self.emit(SyncEvent::Error(e.to_string()));
                self.set_status(SyncState::Offline)
            }
        }
    }

    /// Run a sync pass with the current token
    ///
    /// Single-flight: a call while a pass is running returns the current
    /// state without starting another.
    pub async fn on_token(&self) -> SyncState {
        let Ok(_guard) = self.sync_guard.try_lock() else {
            debug!("Sync already in progress");
            return self.status();
        };

        let Some(generation) = self.session.current_generation() else {
            return self.set_status(SyncState::Offline);
        };

        self.set_status(SyncState::Syncing);
        match self.sync_pass(generation).await {
            Ok(_) if !self.session.is_connected() => {
                debug!("Disconnected while the last write was in flight");
                self.set_status(SyncState::Offline)
            }
            Ok(outcome) => {
                if let Err(e) = self.local.set_connected(true) {
                    warn!(error = %e, "Failed to store connection marker");
                }
                match outcome {
                    SyncOutcome::Merged(stats) => info!(
                        added = stats.added,
                        replaced = stats.replaced,
                        "Sync complete"
                    ),
                    SyncOutcome::Uploaded { records } => {
                        info!(records, "Sync complete, uploaded local catalog")
                    }
                }
                self.set_status(SyncState::Synced)
            }
            Err(SyncError::SessionEnded) => {
                debug!("Session ended during sync");
                self.set_status(SyncState::Offline)
            }
            Err(e) => {
                warn!(error = %e, "Sync failed");
                // Saves stamped before the failure must not overwrite
                // remote data that was never merged
                self.scheduler.cancel();
                self.session.advance();
                self.emit(SyncEvent::Error(e.to_string()));
                self.set_status(SyncState::Offline)
            }
        }
    }

    /// User-initiated disconnect
    ///
    /// Drops pending saves, revokes the token, has the provider forget its
    /// stored grant, forgets the connection marker and account hint. Works
    /// without a live session. Local records are kept.
    pub async fn disconnect(&self) -> SyncState {
        self.scheduler.cancel();
        self.broker.revoke().await;

        if let Err(e) = self.local.set_connected(false) {
            warn!(error = %e, "Failed to clear connection marker");
        }
        if let Err(e) = self.local.remove(LocalKey::UserHint) {
            warn!(error = %e, "Failed to clear account hint");
        }
        info!("Disconnected");
        self.set_status(SyncState::Offline)
    }

    /// Request a remote save after a local edit
    ///
    /// Ignored unless connected and synced (or syncing). Returns whether
    /// the save was scheduled.
    pub fn schedule_save(&self, records: RecordSet) -> bool {
        match self.status() {
            SyncState::Synced | SyncState::Syncing => self.scheduler.schedule_save(records),
            state => {
                debug!(%state, "Not synced, save not scheduled");
                false
            }
        }
    }

    /// Write any pending save now
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    async fn sync_pass(&self, generation: u64) -> SyncResult<SyncOutcome> {
        let snapshot = self.fetch_remote(generation).await?;

        match snapshot.records {
            Some(remote) => {
                let handle = snapshot.handle;
                // Read local only now so edits made during the fetch are merged
                self.session.ensure_current(generation)?;
                let local = self.local.load_records()?;
                let (merged, stats) = merge_with_stats(&local, &remote);
                self.local.save_records(&merged)?;
                let generation = self.session.advance();
                self.emit(SyncEvent::RecordsUpdated(merged.clone()));

                self.remote
                    .write_file(generation, handle.as_ref(), &merged)
                    .await?;
                Ok(SyncOutcome::Merged(stats))
            }
            None => {
                self.session.ensure_current(generation)?;
                let local = self.local.load_records()?;
                let generation = self.session.advance();

                // An unreadable file is overwritten in place
                self.remote
                    .write_file(generation, snapshot.handle.as_ref(), &local)
                    .await?;
                Ok(SyncOutcome::Uploaded {
                    records: local.len(),
                })
            }
        }
    }

    async fn fetch_remote(&self, generation: u64) -> SyncResult<RemoteSnapshot> {
        let Some(mut handle) = self.remote.locate_file(generation).await? else {
            return Ok(RemoteSnapshot {
                handle: None,
                records: None,
            });
        };

        let mut result = self.remote.read_file(generation, &handle).await;
        if let Err(SyncError::Remote(RemoteError::NotFound)) = result {
            debug!(file_id = %handle.id, "Remote catalog vanished, locating again");
            match self.remote.locate_file(generation).await? {
                Some(relocated) => {
                    handle = relocated;
                    result = self.remote.read_file(generation, &handle).await;
                }
                None => {
                    return Ok(RemoteSnapshot {
                        handle: None,
                        records: None,
                    })
                }
            }
        }

        match result {
            Ok(records) => Ok(RemoteSnapshot {
                handle: Some(handle),
                records: Some(records),
            }),
            Err(SyncError::Parse(details)) => {
                warn!(file_id = %handle.id, %details, "Remote catalog is unreadable, replacing it");
                Ok(RemoteSnapshot {
                    handle: Some(handle),
                    records: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.broker.spawn_renewal());
        tasks.push(spawn_token_listener(
            Arc::downgrade(self),
            self.broker.subscribe(),
        ));
    }

    /// Set the state and notify observers
    fn set_status(&self, state: SyncState) -> SyncState {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Sync state changed");
        }
        self.emit(SyncEvent::StatusChanged(state));
        state
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// React to tokens the orchestrator did not ask for
///
/// Requested tokens are handled by the caller that requested them.
fn spawn_token_listener(
    orchestrator: Weak<SyncOrchestrator>,
    mut events: broadcast::Receiver<TokenEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Token listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            match event {
                TokenEvent::Issued {
                    source: TokenSource::Renewal,
                    ..
                } => {
                    debug!("Token renewed, syncing");
                    orchestrator.on_token().await;
                }
                TokenEvent::Issued { .. } => {}
                TokenEvent::Lost => {
                    orchestrator.scheduler.cancel();
                    orchestrator.emit(SyncEvent::Error("Session expired".to_string()));
                    orchestrator.set_status(SyncState::Offline);
                }
            }
        }
    })
}
