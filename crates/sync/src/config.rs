// Local configuration for a deskspace sync instance.
//
// Config file: `~/.deskspace/config.toml`
// Session markers: `<state_dir>/sessions/` (defaults to `~/.deskspace/`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::fast_path::FastPathConfig;
use crate::engine::policy::UpdatePolicy;

/// Root directory for deskspace local state: `~/.deskspace/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".deskspace"))
}

/// Path to the config file: `~/.deskspace/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Override for the local state directory (session markers).
    pub state_dir: Option<PathBuf>,
    pub backend: BackendConfig,
    pub policy: UpdatePolicy,
    pub presence: PresenceConfig,
    pub persistence: PersistenceConfig,
    pub fast_path: FastPathConfig,
}

impl SyncConfig {
    /// Load from `~/.deskspace/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories). The file may hold
    /// a bearer token, so it is made owner-only on unix.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        restrict_to_owner(path)?;
        Ok(())
    }

    /// Directory for local session markers.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(global_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("deskspace"))
    }
}

// ── Sections ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the space REST API. Unset means in-memory (offline) mode.
    pub url: Option<String>,
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { url: None, token: None, request_timeout_ms: 10_000 }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { heartbeat_interval_ms: 5_000, idle_timeout_ms: 60_000, stale_after_ms: 30_000 }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub drag_save_debounce_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub init_lock_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            drag_save_debounce_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 250,
            init_lock_timeout_ms: 10_000,
        }
    }
}

impl PersistenceConfig {
    pub fn drag_save_debounce(&self) -> Duration {
        Duration::from_millis(self.drag_save_debounce_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn init_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.init_lock_timeout_ms)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}
