//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/cams/config.toml)
//! 3. Environment variables (CAMS_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::FileStore;

/// Environment variable prefix
const ENV_PREFIX: &str = "CAMS";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local data (catalog, sync markers, logs)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// OAuth client id registered with the identity provider
    #[serde(default)]
    pub client_id: Option<String>,

    /// OAuth client secret (installed-app clients treat it as public)
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Name of the singleton file in the remote app folder
    #[serde(default = "default_remote_file_name")]
    pub remote_file_name: String,

    /// Quiet period before a scheduled save is written
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Minimum interval between two remote writes
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// How long before expiry a token is silently renewed
    #[serde(default = "default_renew_margin_secs")]
    pub renew_margin_secs: u64,

    /// Log file path (defaults to <data_dir>/cams.log)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            client_id: None,
            client_secret: None,
            remote_file_name: default_remote_file_name(),
            debounce_ms: default_debounce_ms(),
            cooldown_ms: default_cooldown_ms(),
            renew_margin_secs: default_renew_margin_secs(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CAMS_DATA_DIR, CAMS_CLIENT_ID, ...)
    /// 2. Config file (~/.config/cams/config.toml or CAMS_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CLIENT_ID", ENV_PREFIX)) {
            self.client_id = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CLIENT_SECRET", ENV_PREFIX)) {
            self.client_secret = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = non_empty(val).map(PathBuf::from);
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CAMS_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cams")
            .join("config.toml")
    }

    /// Local persistence rooted at the data directory
    pub fn local_store(&self) -> FileStore {
        FileStore::new(&self.data_dir)
    }

    /// Path of the log file
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cams.log"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_secs(self.renew_margin_secs)
    }

    /// Whether remote sync can be attempted at all
    pub fn sync_configured(&self) -> bool {
        self.client_id.is_some()
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cams")
}

fn default_remote_file_name() -> String {
    "data.json".to_string()
}

fn default_debounce_ms() -> u64 {
    1500
}

fn default_cooldown_ms() -> u64 {
    3000
}

fn default_renew_margin_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "CAMS_DATA_DIR",
        "CAMS_CLIENT_ID",
        "CAMS_CLIENT_SECRET",
        "CAMS_LOG_FILE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.client_id.is_none());
        assert!(!config.sync_configured());
        assert_eq!(config.remote_file_name, "data.json");
        assert_eq!(config.debounce(), Duration::from_millis(1500));
        assert_eq!(config.cooldown(), Duration::from_secs(3));
        assert!(config.data_dir.ends_with("cams"));
    }

    #[test]
    fn test_log_path_default() {
        let config = Config::default();
        assert!(config.log_path().ends_with("cams.log"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CAMS_DATA_DIR", "/tmp/cams-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/cams-test"));
    }

    #[test]
    fn test_env_override_client_id() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CAMS_CLIENT_ID", "abc.apps.example");
        config.apply_env_overrides();
        assert_eq!(config.client_id.as_deref(), Some("abc.apps.example"));
        assert!(config.sync_configured());

        // Empty string clears it
        env::set_var("CAMS_CLIENT_ID", "");
        config.apply_env_overrides();
        assert!(config.client_id.is_none());
    }

    #[test]
    fn test_serialization() {
        let config = Config {
            data_dir: PathBuf::from("/data/cams"),
            client_id: Some("client".to_string()),
            debounce_ms: 10,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("debounce_ms"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.client_id, config.client_id);
        assert_eq!(parsed.debounce_ms, 10);
    }

    #[test]
    fn test_load_from_str_fills_defaults() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            cooldown_ms = 500
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.cooldown(), Duration::from_millis(500));
        assert_eq!(config.debounce_ms, 1500);
        assert_eq!(config.remote_file_name, "data.json");
    }

    #[test]
    fn test_save_and_load_path() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            client_id: Some("id".to_string()),
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.client_id.as_deref(), Some("id"));
        assert!(loaded.data_dir.exists());
    }
}
