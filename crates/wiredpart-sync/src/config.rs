//! # Sync Configuration
//!
//! Configuration management for the folder sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     WIREDPART_SYNC_FOLDER=/mnt/dropbox/wiredpart                       │
//! │     WIREDPART_DEVICE_ID=laptop-1                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/wiredpart/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.wiredpart.wiredpart/sync.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     sync disabled, channel "default", 60 minute interval               │
//! │                                                                         │
//! │  The device id itself lives in the local database (sync_state) unless  │
//! │  [device].id overrides it.                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! name = "Shop Laptop"
//!
//! [sync]
//! enabled = true
//! folder_path = "/Users/me/Dropbox/WiredPartSync"
//! channel = "default"
//! interval_minutes = 60
//!
//! [lock]
//! timeout_secs = 30
//! staleness_secs = 300
//! ```

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use wiredpart_core::validation::{validate_device_id, validate_table_name};
use wiredpart_core::SYNC_TABLES;

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier override.
    /// When unset the id persisted in the local database is used, generated
    /// on first run.
    #[serde(default)]
    pub id: Option<String>,

    /// Human-readable device name (e.g., "Shop Laptop", "Truck 2 Tablet").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "WiredPart Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: None,
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Shared-folder sync behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Master switch.
    #[serde(default)]
    pub enabled: bool,

    /// Root of the shared folder (e.g. a cloud-synced directory).
    #[serde(default)]
    pub folder_path: Option<PathBuf>,

    /// Subtree of the shared folder used by this group of devices.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Minutes between scheduled rounds.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Upper bound on any single folder operation (seconds).
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Synchronized tables, parents before children.
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
}

fn default_channel() -> String {
    "default".to_string()
}
fn default_interval_minutes() -> u64 {
    60
}
fn default_io_timeout() -> u64 {
    10
}
fn default_tables() -> Vec<String> {
    SYNC_TABLES.iter().map(|t| t.to_string()).collect()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: false,
            folder_path: None,
            channel: default_channel(),
            interval_minutes: default_interval_minutes(),
            io_timeout_secs: default_io_timeout(),
            tables: default_tables(),
        }
    }
}

// =============================================================================
// Lock Settings
// =============================================================================

/// Lock Coordinator policy.
///
/// These are tuning knobs, not protocol: devices with different values
/// still interoperate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Give up acquiring after this long (seconds).
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,

    /// A token older than this is considered abandoned (seconds).
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,

    /// First retry delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay cap (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_lock_timeout() -> u64 {
    30
}
fn default_staleness() -> u64 {
    300
}
fn default_initial_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    5_000
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            timeout_secs: default_lock_timeout(),
            staleness_secs: default_staleness(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn staleness(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.staleness_secs as i64)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// =============================================================================
// Status & Retention Settings
// =============================================================================

/// Status Reporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    /// Report stale when the last successful round is older than this.
    #[serde(default = "default_stale_after")]
    pub stale_after_minutes: u64,
}

fn default_stale_after() -> u64 {
    // Two missed scheduled rounds at the default interval.
    120
}

impl Default for StatusSettings {
    fn default() -> Self {
        StatusSettings {
            stale_after_minutes: default_stale_after(),
        }
    }
}

/// Change Set garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default = "default_true")]
    pub gc_enabled: bool,

    /// Never delete a Change Set younger than this, acknowledged or not.
    #[serde(default = "default_min_age_hours")]
    pub min_age_hours: u64,
}

fn default_true() -> bool {
    true
}
fn default_min_age_hours() -> u64 {
    24 * 7
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            gc_enabled: true,
            min_age_hours: default_min_age_hours(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
///
/// ## Example Config File
/// ```toml
/// [device]
/// name = "Front Desk"
///
/// [sync]
/// enabled = true
/// folder_path = "/mnt/share/wiredpart"
/// channel = "shop-main"
/// interval_minutes = 15
///
/// [lock]
/// timeout_secs = 30
/// staleness_secs = 300
///
/// [status]
/// stale_after_minutes = 60
///
/// [retention]
/// gc_enabled = true
/// min_age_hours = 168
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub status: StatusSettings,

    #[serde(default)]
    pub retention: RetentionSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled config pointing at `folder` (handy for tests and `init`).
    pub fn for_folder(folder: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.sync.enabled = true;
        config.sync.folder_path = Some(folder.into());
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    SyncError::ConfigLoadFailed(format!("{}: {e}", path.display()))
                })?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<PathBuf> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::ConfigSaveFailed(format!("{}: {e}", parent.display()))
            })?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)
            .map_err(|e| SyncError::ConfigSaveFailed(format!("{}: {e}", path.display())))?;

        info!(?path, "Sync config saved");
        Ok(path)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(id) = &self.device.id {
            validate_device_id(id).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if self.sync.channel.is_empty()
            || !self
                .sync
                .channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SyncError::InvalidConfig(format!(
                "channel must be non-empty ASCII letters, digits, '-' or '_', got: '{}'",
                self.sync.channel
            )));
        }

        if self.sync.interval_minutes == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_minutes must be greater than 0".into(),
            ));
        }

        if self.sync.io_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "io_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.tables.is_empty() {
            return Err(SyncError::InvalidConfig("tables must not be empty".into()));
        }
        for table in &self.sync.tables {
            validate_table_name(table).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if self.lock.staleness_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "lock.staleness_secs must be greater than 0".into(),
            ));
        }

        if self.lock.initial_backoff_ms == 0 || self.lock.max_backoff_ms < self.lock.initial_backoff_ms {
            return Err(SyncError::InvalidConfig(
                "lock backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("WIREDPART_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = Some(id);
        }

        if let Ok(name) = std::env::var("WIREDPART_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(enabled) = std::env::var("WIREDPART_SYNC_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.sync.enabled = true,
                "0" | "false" | "no" | "off" => self.sync.enabled = false,
                _ => warn!(value = %enabled, "Unknown WIREDPART_SYNC_ENABLED value"),
            }
        }

        if let Ok(folder) = std::env::var("WIREDPART_SYNC_FOLDER") {
            debug!(folder = %folder, "Overriding sync folder from environment");
            self.sync.folder_path = Some(PathBuf::from(folder));
        }

        if let Ok(channel) = std::env::var("WIREDPART_SYNC_CHANNEL") {
            self.sync.channel = channel;
        }

        if let Ok(minutes) = std::env::var("WIREDPART_SYNC_INTERVAL_MINUTES") {
            if let Ok(m) = minutes.parse::<u64>() {
                self.sync.interval_minutes = m;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "wiredpart", "wiredpart")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the default local database path.
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "wiredpart", "wiredpart")
            .map(|dirs| dirs.data_dir().join("wiredpart.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the configured device id override, if any.
    pub fn device_id_override(&self) -> Option<&str> {
        self.device.id.as_deref()
    }

    /// Directory holding this channel's Change Sets and lock token.
    pub fn channel_path(&self) -> Option<PathBuf> {
        self.sync
            .folder_path
            .as_ref()
            .map(|root| root.join(&self.sync.channel))
    }

    /// Returns true if sync is enabled and a folder path is set.
    ///
    /// Whether the folder is reachable right now is a separate, per-round
    /// question (see `FsFolder::check_root`).
    pub fn is_configured(&self) -> bool {
        self.sync.enabled
            && self
                .sync
                .folder_path
                .as_ref()
                .is_some_and(|p| !p.as_os_str().is_empty())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_minutes * 60)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.io_timeout_secs)
    }

    pub fn stale_after(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.status.stale_after_minutes as i64)
    }

    pub fn min_change_set_age(&self) -> ChronoDuration {
        ChronoDuration::hours(self.retention.min_age_hours as i64)
    }
}
