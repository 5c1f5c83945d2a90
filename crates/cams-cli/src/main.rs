//! CAMS CLI
//!
//! Command-line interface for CAMS - a local-first actor catalog with
//! optional Google Drive sync.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cams_core::{Catalog, Config};

mod commands;
mod output;
mod prompt;
mod remote;

use commands::record::{NewRecord, RecordChanges};
use output::{Output, OutputFormat};
use remote::Remote;

#[derive(Parser)]
#[command(name = "cams")]
#[command(about = "CAMS - Local-first actor catalog with Google Drive sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use a specific config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a record
    Add {
        /// Romanized name
        english: String,
        /// Name in Chinese characters
        chinese: String,
        /// Tags to add
        #[arg(short, long)]
        tag: Vec<String>,
        /// Image URL or data URL
        #[arg(short, long)]
        image: Option<String>,
        /// Mark as favorite
        #[arg(short, long)]
        favorite: bool,
    },
    /// List records, sorted by romanized name
    #[command(alias = "ls")]
    List {
        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,
        /// Only favorites
        #[arg(short, long)]
        favorites: bool,
    },
    /// Search by name or tag
    Search {
        /// Search query
        query: String,
    },
    /// Show record details
    Show {
        /// Record ID (full or prefix)
        id: String,
    },
    /// Edit a record (interactive without flags)
    Edit {
        /// Record ID (full or prefix)
        id: String,
        /// New romanized name
        #[arg(long)]
        english: Option<String>,
        /// New Chinese name
        #[arg(long)]
        chinese: Option<String>,
        /// New image reference
        #[arg(long)]
        image: Option<String>,
        /// Replace all tags (comma-separated)
        #[arg(long)]
        tags: Option<String>,
        /// Add a tag
        #[arg(long)]
        add_tag: Vec<String>,
        /// Remove a tag
        #[arg(long)]
        remove_tag: Vec<String>,
    },
    /// Toggle the favorite flag
    #[command(alias = "fav")]
    Favorite {
        /// Record ID (full or prefix)
        id: String,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Remove {
        /// Record ID (full or prefix)
        id: String,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete all records
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List all tags
    Tags,
    /// Export the catalog as JSON (`-` for stdout)
    Export {
        file: PathBuf,
    },
    /// Replace the catalog with records from a JSON file
    Import {
        file: PathBuf,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Sign in with Google and sync
    Connect,
    /// Sign out and stop syncing
    Disconnect,
    /// Sync with Google Drive now
    Sync,
    /// Show status (sync, storage, counts)
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (client_id, remote_file_name, debounce_ms, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work without the catalog
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config = commands::config::load(config_path)?;
    init_logging(&config, cli.verbose);

    let catalog = Catalog::open(&config)?;

    if let Commands::Status = cli.command {
        return commands::status::show(&config, &catalog, &output);
    }

    let mut remote = Remote::open(&config, &catalog)?;

    match cli.command {
        Commands::Connect => {
            return commands::sync::connect(&config, &catalog, &mut remote, &output).await;
        }
        Commands::Disconnect => {
            return commands::sync::disconnect(&catalog, &mut remote, &output).await;
        }
        Commands::Sync => {
            return commands::sync::sync(&config, &catalog, &mut remote, &output).await;
        }
        _ => {}
    }

    // Merge the remote file first so reads are current and edits build on it
    remote.start(&output).await;
    info!(state = %remote.status(), "Catalog ready");

    run_record_command(cli.command, &catalog, &mut remote, &output).await
}

async fn run_record_command(
    command: Commands,
    catalog: &Catalog,
    remote: &mut Remote,
    output: &Output,
) -> Result<()> {
    use commands::{record, transfer};

    match command {
        Commands::Add {
            english,
            chinese,
            tag,
            image,
            favorite,
        } => {
            let fields = NewRecord {
                english,
                chinese,
                tags: tag,
                image,
                favorite,
            };
            record::add(catalog, remote, fields, output).await
        }
        Commands::List { tag, favorites } => record::list(catalog, tag, favorites, output),
        Commands::Search { query } => record::search(catalog, query, output),
        Commands::Show { id } => record::show(catalog, id, output),
        Commands::Edit {
            id,
            english,
            chinese,
            image,
            tags,
            add_tag,
            remove_tag,
        } => {
            let changes = RecordChanges {
                english,
                chinese,
                image,
                tags: tags.as_deref().map(prompt::parse_tags),
                add_tags: add_tag,
                remove_tags: remove_tag,
            };
            record::edit(catalog, remote, id, changes, output).await
        }
        Commands::Favorite { id } => record::favorite(catalog, remote, id, output).await,
        Commands::Remove { id, yes } => record::remove(catalog, remote, id, yes, output).await,
        Commands::Clear { yes } => record::clear(catalog, remote, yes, output).await,
        Commands::Tags => record::tags(catalog, output),
        Commands::Export { file } => transfer::export(catalog, file, output),
        Commands::Import { file, yes } => {
            transfer::import(catalog, remote, file, yes, output).await
        }
        Commands::Connect
        | Commands::Disconnect
        | Commands::Sync
        | Commands::Status
        | Commands::Config { .. } => {
            anyhow::bail!("Command is not a catalog operation")
        }
    }
}

/// Initialize logging to the log file, or to stderr with --verbose
///
/// Level comes from CAMS_LOG (default: info).
fn init_logging(config: &Config, verbose: bool) {
    let log_level = std::env::var("CAMS_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::new(format!("cams_core={},cams_cli={}", log_level, log_level));

    if verbose {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    }

    let log_path = config.log_path();
    let log_file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Could not open log file {:?}", log_path))
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: {:#}", e);
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_with_tags() {
        let cli = Cli::try_parse_from(["cams", "add", "Yang Mi", "杨幂", "-t", "drama", "-t", "film"])
            .unwrap();
        match cli.command {
            Commands::Add { english, tag, .. } => {
                assert_eq!(english, "Yang Mi");
                assert_eq!(tag, vec!["drama", "film"]);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from(["cams", "list", "--favorites", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::List { favorites: true, .. }));
    }
}
