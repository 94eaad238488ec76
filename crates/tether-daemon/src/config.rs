//! Daemon configuration.
//!
//! Loaded once at startup from `config.json` in the platform config directory
//! (`~/.config/tether` on Linux). A missing file yields the defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DaemonError, Result};

const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_EVICT_AFTER_MS: u64 = 60_000;
const DEFAULT_LARGE_MESSAGE_WARN_BYTES: usize = 5 * 1024 * 1024;

fn default_init_timeout_ms() -> u64 {
    DEFAULT_INIT_TIMEOUT_MS
}

fn default_evict_after_ms() -> u64 {
    DEFAULT_EVICT_AFTER_MS
}

fn default_large_message_warn_bytes() -> usize {
    DEFAULT_LARGE_MESSAGE_WARN_BYTES
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Deadline for the capability-query handshake
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// How long a disconnected connection stays in the directory
    #[serde(default = "default_evict_after_ms")]
    pub evict_after_ms: u64,

    /// Per-plugin queue bound; `None` keeps queues unbounded
    #[serde(default)]
    pub max_queue_size: Option<usize>,

    /// Inbound frames larger than this are logged as warnings
    #[serde(default = "default_large_message_warn_bytes")]
    pub large_message_warn_bytes: usize,

    /// Background plugins started for every app
    #[serde(default)]
    pub background_plugins: Vec<String>,

    /// Background plugins the user enabled, per app name
    #[serde(default)]
    pub enabled_plugins: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            evict_after_ms: DEFAULT_EVICT_AFTER_MS,
            max_queue_size: None,
            large_message_warn_bytes: DEFAULT_LARGE_MESSAGE_WARN_BYTES,
            background_plugins: Vec::new(),
            enabled_plugins: HashMap::new(),
            socket_path: None,
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] for zero timeouts or a zero queue bound.
    pub fn validate(&self) -> Result<()> {
        if self.init_timeout_ms == 0 {
            return Err(DaemonError::Config(
                "initTimeoutMs must be positive".to_string(),
            ));
        }
        if self.max_queue_size == Some(0) {
            return Err(DaemonError::Config(
                "maxQueueSize must be positive when set".to_string(),
            ));
        }
        if self.max_queue_size.is_some() {
            warn!(
                "Plugin queues bounded at {:?} messages; oldest messages are dropped on overflow",
                self.max_queue_size
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    #[must_use]
    pub fn evict_after(&self) -> Duration {
        Duration::from_millis(self.evict_after_ms)
    }

    /// Whether a background plugin should be started as soon as `app`
    /// connects.
    #[must_use]
    pub fn should_connect_background_plugin(&self, app: &str, plugin_id: &str) -> bool {
        self.background_plugins.iter().any(|p| p == plugin_id)
            || self
                .enabled_plugins
                .get(app)
                .is_some_and(|plugins| plugins.iter().any(|p| p == plugin_id))
    }

    /// Default location of `config.json`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tether").map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Socket path: configured, else `$XDG_RUNTIME_DIR/tether.sock`, else the
    /// system temp directory.
    #[must_use]
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

#[must_use]
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("tether.sock")
}
