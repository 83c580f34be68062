//! # Sync Health
//!
//! Derives the human-facing sync status from durable sync state.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Health Derivation                               │
//! │                                                                         │
//! │  StatusInputs ──┐                                                      │
//! │  now ───────────┼──► derive_health() ──► SyncHealth ──► presentation   │
//! │  stale_after ───┘         (pure)                                       │
//! │                                                                         │
//! │  State precedence (first match wins):                                  │
//! │    Failing    last round hit a commit, config or unexpected error      │
//! │    Offline    shared folder unreachable                                │
//! │    Deferred   another device held the lock                             │
//! │    NeverSynced                                                         │
//! │    Stale      now - last_sync_at > stale_after                         │
//! │    Pending    local changes newer than the watermark                   │
//! │    Healthy                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A device that has never completed a round reports `is_stale = true`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Broad class of the most recent round failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Shared folder missing or timed out.
    Offline,
    /// Lock held by a live peer.
    Deferred,
    /// Local store write failed during commit.
    Commit,
    /// Sync is disabled or misconfigured.
    Config,
    /// Anything else.
    Other,
}

/// The last recorded round failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Durable state the status is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusInputs {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_local_changes: u64,
    pub last_round_conflicts: u64,
    pub last_error: Option<LastError>,
}

/// Overall state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    NeverSynced,
    Healthy,
    Pending,
    Stale,
    Offline,
    Deferred,
    Failing,
}

impl HealthState {
    /// Short label for logs and the CLI.
    pub fn label(&self) -> &'static str {
        match self {
            HealthState::NeverSynced => "never synced",
            HealthState::Healthy => "up to date",
            HealthState::Pending => "changes pending",
            HealthState::Stale => "stale",
            HealthState::Offline => "offline",
            HealthState::Deferred => "sync deferred",
            HealthState::Failing => "failing",
        }
    }
}

/// The exposed status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncHealth {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
    #[ts(type = "number")]
    pub pending_local_changes: u64,
    #[ts(type = "number")]
    pub last_round_conflicts: u64,
    pub last_error: Option<LastError>,
    pub state: HealthState,
}

/// Computes sync health. Never reads the clock itself.
pub fn derive_health(inputs: StatusInputs, now: DateTime<Utc>, stale_after: Duration) -> SyncHealth {
    let is_stale = match inputs.last_sync_at {
        Some(last) => now.signed_duration_since(last) > stale_after,
        None => true,
    };

    let state = match inputs.last_error.as_ref().map(|e| e.kind) {
        Some(ErrorKind::Commit | ErrorKind::Config | ErrorKind::Other) => HealthState::Failing,
        Some(ErrorKind::Offline) => HealthState::Offline,
        Some(ErrorKind::Deferred) => HealthState::Deferred,
        None if inputs.last_sync_at.is_none() => HealthState::NeverSynced,
        None if is_stale => HealthState::Stale,
        None if inputs.pending_local_changes > 0 => HealthState::Pending,
        None => HealthState::Healthy,
    };

    SyncHealth {
        last_sync_at: inputs.last_sync_at,
        is_stale,
        pending_local_changes: inputs.pending_local_changes,
        last_round_conflicts: inputs.last_round_conflicts,
        last_error: inputs.last_error,
        state,
    }
}
