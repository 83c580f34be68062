//! # Domain Types
//!
//! Core types shared by every device taking part in folder sync.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Data Model                                 │
//! │                                                                         │
//! │  ┌──────────────────────┐        ┌──────────────────────────────────┐  │
//! │  │       Record         │        │           ChangeSet              │  │
//! │  │  ──────────────────  │        │  ──────────────────────────────  │  │
//! │  │  table_name          │  0..n  │  protocol_version                │  │
//! │  │  record_id           │◄───────│  device_id, sequence             │  │
//! │  │  state: Live|Deleted │        │  created_at                      │  │
//! │  │  updated_at          │        │  tables: [TableChanges]          │  │
//! │  │  origin_device       │        └──────────────────────────────────┘  │
//! │  └──────────────────────┘                                               │
//! │                                                                         │
//! │  RecordState::Live    { fields }      ← authoritative payload          │
//! │  RecordState::Deleted { deleted_at }  ← tombstone, no payload          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! All timestamps are UTC and carried at millisecond precision. The SQLite
//! store keeps them as integer milliseconds, so anything finer would make a
//! version read back from disk compare unequal to the version that was
//! written. Use [`truncate_to_millis`] (or the constructors here, which call
//! it) when stamping a new version.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::PROTOCOL_VERSION;

/// Column name → value payload of a live record.
///
/// A `BTreeMap` keeps the keys sorted so the JSON encoding of a record is
/// canonical, which the merge tie-break relies on.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Truncates a timestamp to whole milliseconds.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Converts stored epoch milliseconds back into a UTC timestamp.
pub fn from_millis(ms: i64) -> CoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(CoreError::TimestampOutOfRange(ms))
}

// =============================================================================
// Record Key
// =============================================================================

/// Identity of a record across all devices: `(table, record_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        RecordKey {
            table: table.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.record_id)
    }
}

// =============================================================================
// Record
// =============================================================================

/// Whether a record version is live or a tombstone.
///
/// Modelled as an enum so a tombstone can never carry a field payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    /// The record exists with this payload.
    Live { fields: Fields },

    /// The record was deleted at `deleted_at`.
    Deleted { deleted_at: DateTime<Utc> },
}

/// One version of one row of a synchronized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Table this row belongs to (e.g. "parts", "jobs").
    pub table_name: String,

    /// Stable identifier, unique within `table_name` on every device.
    pub record_id: String,

    /// Live payload or tombstone.
    #[serde(flatten)]
    pub state: RecordState,

    /// Wall-clock time of the mutation that produced this version.
    pub updated_at: DateTime<Utc>,

    /// Device that produced this version.
    pub origin_device: String,
}

impl Record {
    /// Creates a live record version.
    pub fn live(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        fields: Fields,
        updated_at: DateTime<Utc>,
        origin_device: impl Into<String>,
    ) -> Self {
        Record {
            table_name: table_name.into(),
            record_id: record_id.into(),
            state: RecordState::Live { fields },
            updated_at: truncate_to_millis(updated_at),
            origin_device: origin_device.into(),
        }
    }

    /// Creates a tombstone. `updated_at` is set to the deletion time so both
    /// timestamps sit on the same axis.
    pub fn tombstone(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        deleted_at: DateTime<Utc>,
        origin_device: impl Into<String>,
    ) -> Self {
        let deleted_at = truncate_to_millis(deleted_at);
        Record {
            table_name: table_name.into(),
            record_id: record_id.into(),
            state: RecordState::Deleted { deleted_at },
            updated_at: deleted_at,
            origin_device: origin_device.into(),
        }
    }

    /// Returns the `(table, record_id)` identity.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    /// Returns true if this version is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, RecordState::Deleted { .. })
    }

    /// Deletion time, only for tombstones.
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            RecordState::Deleted { deleted_at } => Some(deleted_at),
            RecordState::Live { .. } => None,
        }
    }

    /// Field payload, only for live versions.
    pub fn fields(&self) -> Option<&Fields> {
        match &self.state {
            RecordState::Live { fields } => Some(fields),
            RecordState::Deleted { .. } => None,
        }
    }

    /// The timestamp this version competes with under last-write-wins:
    /// `deleted_at` for tombstones, `updated_at` otherwise.
    pub fn version_time(&self) -> DateTime<Utc> {
        match self.state {
            RecordState::Deleted { deleted_at } => deleted_at,
            RecordState::Live { .. } => self.updated_at,
        }
    }
}

// =============================================================================
// Change Set
// =============================================================================

/// The ordered records of one table inside a Change Set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChanges {
    pub table: String,
    pub records: Vec<Record>,
}

/// Identifies a published Change Set: the device and its round sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeSetSeq(pub u64);

impl fmt::Display for ChangeSetSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One device's immutable delta for one sync round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Wire protocol this document was written with.
    pub protocol_version: u32,

    /// Publishing device.
    pub device_id: String,

    /// Round sequence of the publishing device (strictly increasing).
    pub sequence: u64,

    /// When the round that produced this Change Set started.
    pub created_at: DateTime<Utc>,

    /// Per-table record lists, in synced-table order.
    pub tables: Vec<TableChanges>,
}

impl ChangeSet {
    /// Creates an empty Change Set at the current protocol version.
    pub fn new(device_id: impl Into<String>, sequence: u64, created_at: DateTime<Utc>) -> Self {
        ChangeSet {
            protocol_version: PROTOCOL_VERSION,
            device_id: device_id.into(),
            sequence,
            created_at: truncate_to_millis(created_at),
            tables: Vec::new(),
        }
    }

    /// Appends a table's records, sorted by `record_id`. Empty lists are
    /// dropped so the document only names tables that changed.
    pub fn push_table(&mut self, table: impl Into<String>, mut records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        self.tables.push(TableChanges {
            table: table.into(),
            records,
        });
    }

    /// Iterates every record in table order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.tables.iter().flat_map(|t| t.records.iter())
    }

    /// Total number of records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.iter().map(|t| t.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    pub fn seq(&self) -> ChangeSetSeq {
        ChangeSetSeq(self.sequence)
    }
}
