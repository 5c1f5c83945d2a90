//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use cams_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, client_id, client_secret, remote_file_name, debounce_ms, \
                    cooldown_ms, renew_margin_secs, log_file";

/// Load from the CLI-specified path or the default one
pub fn load(config_path: Option<&PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config = load(config_path)?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "client_id": config.client_id,
                    "client_secret": config.client_secret.as_ref().map(|_| "(set)"),
                    "remote_file_name": config.remote_file_name,
                    "debounce_ms": config.debounce_ms,
                    "cooldown_ms": config.cooldown_ms,
                    "renew_margin_secs": config.renew_margin_secs,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:          {}", config.data_dir.display());
            println!(
                "  client_id:         {}",
                config.client_id.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  client_secret:     {}",
                if config.client_secret.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  remote_file_name:  {}", config.remote_file_name);
            println!("  debounce_ms:       {}", config.debounce_ms);
            println!("  cooldown_ms:       {}", config.cooldown_ms);
            println!("  renew_margin_secs: {}", config.renew_margin_secs);
            println!(
                "  log_file:          {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config = load(config_path)?;
    apply(&mut config, &key, &value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "client_secret" { "(set)" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "client_id" => config.client_id = optional(value),
        "client_secret" => config.client_secret = optional(value),
        "remote_file_name" => {
            if value.trim().is_empty() {
                bail!("remote_file_name cannot be empty");
            }
            config.remote_file_name = value.to_string();
        }
        "debounce_ms" => config.debounce_ms = parse_number(key, value)?,
        "cooldown_ms" => config.cooldown_ms = parse_number(key, value)?,
        "renew_margin_secs" => config.renew_margin_secs = parse_number(key, value)?,
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid value for {}. Use a whole number.", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "client_id", "abc.apps.googleusercontent.com").unwrap();
        apply(&mut config, "debounce_ms", "500").unwrap();
        apply(&mut config, "remote_file_name", "actors.json").unwrap();

        assert_eq!(
            config.client_id.as_deref(),
            Some("abc.apps.googleusercontent.com")
        );
        assert_eq!(config.debounce_ms, 500);
        assert_eq!(config.remote_file_name, "actors.json");

        apply(&mut config, "client_id", "none").unwrap();
        assert!(config.client_id.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "cooldown_ms", "soon").is_err());
        assert!(apply(&mut config, "remote_file_name", " ").is_err());
        assert!(apply(&mut config, "sync_url", "ws://x").is_err());
    }
}
