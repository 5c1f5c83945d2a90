//! Remote sync wiring for one-shot commands
//!
//! Each invocation reconnects silently when the previous session ended
//! connected, so reads see the merged catalog and writes are pushed before
//! the process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

use cams_core::drive::{DeviceCode, DevicePrompt, DriveStore, GoogleIdentity};
use cams_core::{Catalog, Config, RecordSet, SyncEvent, SyncOrchestrator, SyncSettings, SyncState};

use crate::output::Output;

/// Orchestrator plus its event stream
pub struct Remote {
    sync: Arc<SyncOrchestrator>,
    events: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl Remote {
    /// Wire Google Drive and Google sign-in to the local catalog
    pub fn open(config: &Config, catalog: &Catalog) -> Result<Self> {
        let local = catalog.store();
        let identity = GoogleIdentity::new(config, local.clone(), device_prompt());
        let drive = DriveStore::new().context("Failed to set up Drive client")?;

        let sync = SyncOrchestrator::new(
            Arc::new(identity),
            Arc::new(drive),
            local,
            SyncSettings::from_config(config),
        );
        let events = sync.take_events();
        Ok(Self { sync, events })
    }

    pub fn status(&self) -> SyncState {
        self.sync.status()
    }

    /// Silent reconnect and merge, if previously connected
    pub async fn start(&mut self, output: &Output) -> SyncState {
        let state = self.sync.start().await;
        self.report(output);
        state
    }

    /// Interactive sign-in, then merge
    pub async fn connect(&mut self, output: &Output) -> SyncState {
        let state = self.sync.connect().await;
        self.report(output);
        state
    }

    pub async fn disconnect(&mut self, output: &Output) -> SyncState {
        let state = self.sync.disconnect().await;
        self.report(output);
        state
    }

    /// Write the catalog to the remote file before exit
    ///
    /// Does nothing when offline; the next connect merges local edits.
    pub async fn push(&mut self, records: RecordSet, output: &Output) {
        if self.sync.schedule_save(records) {
            self.sync.flush().await;
        } else {
            debug!("Offline, edit kept locally");
        }
        self.report(output);
    }

    /// Surface sync errors as warnings
    fn report(&mut self, output: &Output) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            match event {
                SyncEvent::Error(message) => output.warn(&format!("Sync: {}", message)),
                SyncEvent::RecordsUpdated(records) => {
                    debug!(count = records.len(), "Catalog updated from remote")
                }
                SyncEvent::StatusChanged(state) => debug!(%state, "Sync state changed"),
            }
        }
    }
}

/// Show the device code and open the verification page
fn device_prompt() -> DevicePrompt {
    Arc::new(|code: &DeviceCode| {
        eprintln!();
        eprintln!("To connect, visit {}", code.verification_url);
        eprintln!("and enter the code:");
        eprintln!();
        eprintln!("    {}", code.user_code);
        eprintln!();
        eprintln!(
            "Waiting for approval (expires in {} minutes)...",
            code.expires_in.as_secs() / 60
        );
        if let Err(e) = open::that(&code.verification_url) {
            debug!(error = %e, "Could not open browser");
        }
    })
}
