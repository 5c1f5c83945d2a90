//! Status command handler

use anyhow::Result;

use cams_core::{Catalog, Config, LocalKey, LocalStore};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(config: &Config, catalog: &Catalog, output: &Output) -> Result<()> {
    let local = catalog.store();
    let connected = local.was_connected()?;
    let account = local.get(LocalKey::UserHint)?;
    let records = catalog.count()?;
    let favorites = catalog.favorites()?.len();
    let size = config.local_store().records_size();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "sync": {
                        "configured": config.sync_configured(),
                        "connected": connected,
                        "account": account,
                        "remote_file": config.remote_file_name,
                    },
                    "storage": {
                        "records_size": size,
                    },
                    "counts": {
                        "records": records,
                        "favorites": favorites,
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", if connected { "connected" } else { "offline" });
        }
        OutputFormat::Human => {
            println!("CAMS Status");
            println!("===========");
            println!();
            println!("Sync:");
            if !config.sync_configured() {
                println!("  Status:  not configured (set client_id)");
            } else if connected {
                println!("  Status:  connected");
                if let Some(ref account) = account {
                    println!("  Account: {}", account);
                }
                println!("  File:    {}", config.remote_file_name);
            } else {
                println!("  Status:  offline");
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Size:     {}", human_size(size.unwrap_or(0)));
            println!();
            println!("Contents:");
            println!("  Records:   {}", records);
            println!("  Favorites: {}", favorites);
        }
    }

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
