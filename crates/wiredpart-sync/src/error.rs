//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Shared Folder  │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  LockBusy       │  │  MalformedChangeSet     │ │
//! │  │  NotConfigured  │  │  LockFolder-    │  │  IncompatibleProtocol-  │ │
//! │  │  ConfigLoad/Save│  │   Unreachable   │  │   Version               │ │
//! │  │                 │  │  FolderTimeout  │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Database     │  │     Commit      │  │      Agent              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DatabaseError  │  │  CommitFailure  │  │  RoundInProgress        │ │
//! │  │                 │  │  (watermark     │  │  ShuttingDown           │ │
//! │  │                 │  │   unchanged)    │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Round outcome:  LockBusy → "deferred"   Unreachable → "offline"       │
//! │                  CommitFailure → "failed", retried next round          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use thiserror::Error;
use wiredpart_core::ErrorKind;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Sync is disabled, no folder is set, or the folder root is missing.
    ///
    /// ## When This Occurs
    /// - `sync.enabled = false`
    /// - `sync.folder_path` is empty
    #[error("Sync not configured: {0}")]
    NotConfigured(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Shared Folder Errors
    // =========================================================================
    /// A live peer holds the lock and did not release it before the timeout.
    ///
    /// ## When This Occurs
    /// - Another device is in the middle of its own round
    #[error("Another device ({holder}) is syncing; lock held for {age_secs}s")]
    LockBusy { holder: String, age_secs: i64 },

    /// The shared folder is missing, disconnected or refusing access.
    ///
    /// ## When This Occurs
    /// - Cloud drive not mounted
    /// - Network share offline
    /// - Permission denied on the channel directory
    #[error("Sync folder unreachable at {path}: {reason}")]
    LockFolderUnreachable { path: PathBuf, reason: String },

    /// A folder operation did not complete within the I/O timeout.
    #[error("Sync folder timed out after {0} seconds")]
    FolderTimeout(u64),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A Change Set file is truncated or not a valid document.
    #[error("Malformed change set {file}: {reason}")]
    MalformedChangeSet { file: String, reason: String },

    /// A Change Set was written by a different protocol version.
    #[error("Change set {file} uses protocol version {found}, this build speaks {supported}; update the app")]
    IncompatibleProtocolVersion {
        file: String,
        found: u32,
        supported: u32,
    },

    /// Failed to serialize a document.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database query failed outside the commit stage.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Applying merged records or committing state failed.
    ///
    /// The watermark was not advanced; the next round recomputes and
    /// re-applies the same delta.
    #[error("Commit failed after {applied} record(s): {reason}")]
    CommitFailure { applied: usize, reason: String },

    // =========================================================================
    // Agent Errors
    // =========================================================================
    /// A round is already running on this device.
    #[error("A sync round is already in progress")]
    RoundInProgress,

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<wiredpart_db::DbError> for SyncError {
    fn from(err: wiredpart_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic and status)
// =============================================================================

impl SyncError {
    /// Returns true if the next scheduled round may succeed without any
    /// user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LockBusy { .. }
                | SyncError::LockFolderUnreachable { .. }
                | SyncError::FolderTimeout(_)
                | SyncError::CommitFailure { .. }
                | SyncError::RoundInProgress
        )
    }

    /// Returns true if the shared folder could not be reached.
    ///
    /// Offline is a quiet, expected outcome; callers log it at `info`.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            SyncError::LockFolderUnreachable { .. } | SyncError::FolderTimeout(_)
        )
    }

    /// Returns true if the round was put off because someone else is busy.
    pub fn is_deferred(&self) -> bool {
        matches!(self, SyncError::LockBusy { .. } | SyncError::RoundInProgress)
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::NotConfigured(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a document format problem.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedChangeSet { .. }
                | SyncError::IncompatibleProtocolVersion { .. }
                | SyncError::SerializationFailed(_)
        )
    }

    /// Short outcome label for logs and status ("offline", "deferred", ...).
    pub fn outcome_label(&self) -> &'static str {
        if self.is_offline() {
            "offline"
        } else if self.is_deferred() {
            "deferred"
        } else if self.is_config_error() {
            "not configured"
        } else if matches!(self, SyncError::CommitFailure { .. }) {
            "commit failed"
        } else {
            "failed"
        }
    }

    /// Status class of this error.
    pub fn kind(&self) -> ErrorKind {
        if self.is_offline() {
            ErrorKind::Offline
        } else if self.is_deferred() {
            ErrorKind::Deferred
        } else if self.is_config_error() {
            ErrorKind::Config
        } else if matches!(self, SyncError::CommitFailure { .. }) {
            ErrorKind::Commit
        } else {
            ErrorKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::LockBusy {
            holder: "dev-b".into(),
            age_secs: 12
        }
        .is_retryable());
        assert!(SyncError::FolderTimeout(10).is_retryable());
        assert!(SyncError::CommitFailure {
            applied: 3,
            reason: "disk full".into()
        }
        .is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::NotConfigured("disabled".into()).is_retryable());
    }

    #[test]
    fn test_outcome_labels() {
        let offline = SyncError::LockFolderUnreachable {
            path: PathBuf::from("/mnt/share"),
            reason: "not found".into(),
        };
        assert_eq!(offline.outcome_label(), "offline");
        assert_eq!(offline.kind(), ErrorKind::Offline);

        let busy = SyncError::LockBusy {
            holder: "dev-b".into(),
            age_secs: 3,
        };
        assert_eq!(busy.outcome_label(), "deferred");
        assert_eq!(busy.kind(), ErrorKind::Deferred);

        assert_eq!(SyncError::NotConfigured("x".into()).kind(), ErrorKind::Config);
        assert_eq!(SyncError::Internal("x".into()).outcome_label(), "failed");
    }

    #[test]
    fn test_protocol_errors_are_distinct() {
        let malformed = SyncError::MalformedChangeSet {
            file: "dev-b.000000000001.json".into(),
            reason: "EOF while parsing".into(),
        };
        let incompatible = SyncError::IncompatibleProtocolVersion {
            file: "dev-b.000000000002.json".into(),
            found: 2,
            supported: 1,
        };
        assert!(malformed.is_protocol_error());
        assert!(incompatible.is_protocol_error());
        assert!(incompatible.to_string().contains("update the app"));
        assert!(!malformed.to_string().contains("update the app"));
    }

    #[test]
    fn test_lock_busy_names_holder() {
        let err = SyncError::LockBusy {
            holder: "laptop-7".into(),
            age_secs: 42,
        };
        assert_eq!(
            err.to_string(),
            "Another device (laptop-7) is syncing; lock held for 42s"
        );
    }
}
