//! Configuration management for the workbench
//!
//! Stores settings in ~/.config/strategy-workbench/config.json. Endpoint URLs
//! can be overridden from the environment; the assistant API key lives in the
//! system keychain or `OPENROUTER_API_KEY`.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_BACKTEST_URL: &str = "http://127.0.0.1:8080/api/";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1500;
pub const DEFAULT_ASSISTANT_MODEL: &str = "anthropic/claude-sonnet-4";

const KEYRING_SERVICE: &str = "strategy-workbench";
const KEYRING_USERNAME: &str = "openrouter_api_key";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the backtest job service
    #[serde(default = "default_backtest_url")]
    pub backtest_url: String,
    /// Remote edit validator. When unset, edits are validated in-process.
    #[serde(default)]
    pub validator_url: Option<String>,
    /// Directory holding strategy files (local validator root)
    #[serde(default = "default_strategies_dir")]
    pub strategies_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ask the assistant to summarize a run once every job has finished
    #[serde(default = "default_auto_narrate")]
    pub auto_narrate: bool,
    #[serde(default = "default_assistant_model")]
    pub assistant_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backtest_url: default_backtest_url(),
            validator_url: None,
            strategies_dir: default_strategies_dir(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            auto_narrate: true,
            assistant_model: default_assistant_model(),
        }
    }
}

fn default_backtest_url() -> String {
    DEFAULT_BACKTEST_URL.to_string()
}

fn default_strategies_dir() -> PathBuf {
    PathBuf::from("user_data/strategies")
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_auto_narrate() -> bool {
    true
}

fn default_assistant_model() -> String {
    DEFAULT_ASSISTANT_MODEL.to_string()
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("WORKBENCH_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    if keyring_disabled() {
        return Ok(None);
    }
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_keyring_key(key: &str) -> Result<(), keyring::Error> {
    keyring_entry()?.set_password(key)
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("strategy-workbench"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk with environment overrides, or defaults
    pub fn load() -> Self {
        let config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.with_env_overrides()
    }

    /// Load from a specific file. A corrupt file is set aside and defaults
    /// are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            debug!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("WORKBENCH_BACKTEST_URL") {
            self.backtest_url = url;
        }
        if let Ok(url) = std::env::var("WORKBENCH_VALIDATOR_URL") {
            self.validator_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        self
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir()
            .ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&dir.join("config.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    /// Backtest service base URL, always ending in `/` so joins nest under it.
    pub fn backtest_base(&self) -> anyhow::Result<Url> {
        let mut raw = self.backtest_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|e| anyhow::anyhow!("Invalid backtest URL {:?}: {}", raw, e))
    }

    /// Get the OpenRouter API key (from environment or keychain)
    pub fn get_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            return Some(key);
        }
        match read_keyring_key() {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "failed to read API key from system keychain");
                None
            }
        }
    }

    /// Store the API key in the system keychain, verifying the write.
    pub fn set_api_key(&self, key: &str) -> Result<(), String> {
        write_keyring_key(key).map_err(|e| {
            format!(
                "Failed to store API key in system keychain: {}. \
                 You can set the {} environment variable instead.",
                e, API_KEY_ENV
            )
        })?;
        match read_keyring_key() {
            Ok(Some(stored)) if stored == key => Ok(()),
            Ok(_) => Err(format!(
                "API key verification failed: key was not persisted to keychain. \
                 You can set the {} environment variable instead.",
                API_KEY_ENV
            )),
            Err(e) => Err(format!(
                "API key verification failed: couldn't read back from keychain ({}).",
                e
            )),
        }
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/strategy-workbench/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!(error = %e, "failed to set temp config file permissions");
        }
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
