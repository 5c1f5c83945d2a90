//! Connection command handlers

use anyhow::{bail, Result};

use cams_core::{Catalog, Config, LocalStore, SyncState};

use crate::output::Output;
use crate::remote::Remote;

/// Sign in interactively and merge with the remote file
pub async fn connect(
    config: &Config,
    catalog: &Catalog,
    remote: &mut Remote,
    output: &Output,
) -> Result<()> {
    require_client(config)?;

    output.message("Connecting to Google Drive...");
    match remote.connect(output).await {
        SyncState::Synced => {
            output.success("Connected and synced");
            output.message(&format!("  Records: {}", catalog.count()?));
            Ok(())
        }
        state => bail!("Connection failed (state: {})", state),
    }
}

/// Sign out and stop syncing; local records are kept
///
/// Never syncs: the stored grant is revoked and removed directly.
pub async fn disconnect(catalog: &Catalog, remote: &mut Remote, output: &Output) -> Result<()> {
    let was_connected = catalog.store().was_connected()?;
    remote.disconnect(output).await;

    if was_connected {
        output.success("Disconnected. Local records are kept.");
    } else {
        output.message("Not connected. Stored sign-in, if any, was removed.");
    }
    Ok(())
}

/// Merge with the remote file now
pub async fn sync(
    config: &Config,
    catalog: &Catalog,
    remote: &mut Remote,
    output: &Output,
) -> Result<()> {
    require_client(config)?;

    if !catalog.store().was_connected()? {
        bail!("Not connected. Connect first with:\n  cams connect");
    }

    output.message("Syncing...");
    let before = catalog.count()?;
    match remote.start(output).await {
        SyncState::Synced => {
            let after = catalog.count()?;
            output.success("Sync complete");
            output.message(&format!("  Records: {} (was {})", after, before));
            Ok(())
        }
        state => bail!(
            "Sync failed (state: {}). Run `cams connect` to sign in again.",
            state
        ),
    }
}

fn require_client(config: &Config) -> Result<()> {
    if !config.sync_configured() {
        bail!(
            "Sync is not configured. Set an OAuth client id with:\n  \
             cams config set client_id <id>"
        );
    }
    Ok(())
}
