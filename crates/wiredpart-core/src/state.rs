//! # Device Sync State
//!
//! The durable per-device state a sync round starts from and the delta a
//! successful round commits. Both are plain values so an engine can be
//! handed one explicitly; several simulated devices can live in one process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::status::{LastError, StatusInputs};

/// Per-device durable sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Stable identity of this device, generated once at first run.
    pub device_id: String,

    /// Local changes at or before this instant are already published.
    /// `None` until the first successful round.
    pub watermark: Option<DateTime<Utc>>,

    /// When the last successful round finished.
    pub last_sync_at: Option<DateTime<Utc>>,

    pub last_round_conflicts: u64,

    /// Highest Change Set sequence this device has committed a round with.
    pub published_sequence: u64,

    /// Peer device → highest Change Set sequence already incorporated.
    pub peer_cursors: BTreeMap<String, u64>,

    pub last_error: Option<LastError>,
}

impl SyncState {
    pub fn new(device_id: impl Into<String>) -> Self {
        SyncState {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Cursor for one peer, 0 if never seen.
    pub fn cursor_for(&self, peer: &str) -> u64 {
        self.peer_cursors.get(peer).copied().unwrap_or(0)
    }

    /// Folds a committed round into this state.
    ///
    /// Sequences and cursors only move forward.
    pub fn apply_commit(&mut self, commit: &RoundCommit) {
        if let Some(watermark) = commit.watermark {
            self.watermark = Some(watermark);
        }
        self.last_sync_at = Some(commit.completed_at);
        self.last_round_conflicts = commit.conflicts;
        if let Some(seq) = commit.published_sequence {
            self.published_sequence = self.published_sequence.max(seq);
        }
        for (peer, seq) in &commit.peer_cursors {
            let cursor = self.peer_cursors.entry(peer.clone()).or_insert(0);
            *cursor = (*cursor).max(*seq);
        }
        self.last_error = None;
    }

    /// Status inputs for this state given the current pending count.
    pub fn status_inputs(&self, pending_local_changes: u64) -> StatusInputs {
        StatusInputs {
            last_sync_at: self.last_sync_at,
            pending_local_changes,
            last_round_conflicts: self.last_round_conflicts,
            last_error: self.last_error.clone(),
        }
    }
}

/// What a successful round writes to durable state, atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundCommit {
    /// New watermark: just before the round's start. `None` leaves it unchanged
    /// (a pull-only round publishes nothing).
    pub watermark: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub conflicts: u64,
    /// Sequence published this round, if any.
    pub published_sequence: Option<u64>,
    /// Highest sequence read per peer this round.
    pub peer_cursors: BTreeMap<String, u64>,
}
