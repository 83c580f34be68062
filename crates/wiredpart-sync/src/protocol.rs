//! # Change Set File Protocol
//!
//! Naming and encoding of the documents devices exchange through the shared
//! folder.
//!
//! ## Change Set File
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  changes/<device_id>.<sequence:012>.json                               │
//! │                                                                         │
//! │  {                                                                      │
//! │    "protocol_version": 1,                                              │
//! │    "device_id": "3f0c…",                                               │
//! │    "sequence": 7,                                                      │
//! │    "created_at": "2026-03-01T09:30:00Z",                               │
//! │    "tables": [                                                         │
//! │      { "table": "parts", "records": [                                  │
//! │          { "table_name": "parts", "record_id": "P-100",                │
//! │            "state": "live", "fields": { … },                           │
//! │            "updated_at": "…", "origin_device": "3f0c…" },              │
//! │          { …, "state": "deleted", "deleted_at": "…" }                  │
//! │      ] }                                                               │
//! │    ]                                                                   │
//! │  }                                                                     │
//! │                                                                         │
//! │  • Zero-padded sequence: names sort chronologically per device         │
//! │  • Device id prefix: names never collide across devices                │
//! │  • Written once, never rewritten                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Acknowledgment File
//! `acks/<device_id>.json` lists, per peer, the highest sequence that device
//! has incorporated, plus the highest of its own sequences it has pruned.
//! It is replaced atomically after every committed round and drives Change
//! Set garbage collection. A reader treats every sequence of that device at
//! or below `pruned_through` as gone, not as missing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wiredpart_core::validation::{validate_change_set, validate_device_id};
use wiredpart_core::{ChangeSet, PROTOCOL_VERSION};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Folder Layout
// =============================================================================

/// Directory holding every device's Change Sets.
pub const CHANGES_DIR: &str = "changes";

/// Directory holding acknowledgment files.
pub const ACKS_DIR: &str = "acks";

const FILE_EXTENSION: &str = ".json";

/// File name of a Change Set, e.g. `dev-a.000000000007.json`.
pub fn change_set_file_name(device_id: &str, sequence: u64) -> String {
    format!("{device_id}.{sequence:012}{FILE_EXTENSION}")
}

/// Folder path of a Change Set.
pub fn change_set_path(device_id: &str, sequence: u64) -> String {
    format!("{CHANGES_DIR}/{}", change_set_file_name(device_id, sequence))
}

/// Splits a Change Set file name into `(device_id, sequence)`.
///
/// Returns `None` for anything that is not a Change Set name (temp files,
/// stray documents dropped into the folder).
pub fn parse_change_set_file_name(name: &str) -> Option<(String, u64)> {
    let stem = name.strip_suffix(FILE_EXTENSION)?;
    let (device_id, sequence) = stem.rsplit_once('.')?;
    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    validate_device_id(device_id).ok()?;
    let sequence = sequence.parse().ok()?;
    Some((device_id.to_string(), sequence))
}

/// Folder path of a device's acknowledgment file.
pub fn ack_path(device_id: &str) -> String {
    format!("{ACKS_DIR}/{device_id}{FILE_EXTENSION}")
}

/// Device id of an acknowledgment file name.
pub fn parse_ack_file_name(name: &str) -> Option<String> {
    let device_id = name.strip_suffix(FILE_EXTENSION)?;
    validate_device_id(device_id).ok()?;
    Some(device_id.to_string())
}

// =============================================================================
// Change Set Codec
// =============================================================================

/// Encodes a Change Set for publishing.
pub fn encode_change_set(change_set: &ChangeSet) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(change_set)?)
}

/// Decodes and validates a Change Set read from `file`.
///
/// ## Errors
/// - [`SyncError::IncompatibleProtocolVersion`] if the document is readable
///   but carries another `protocol_version`
/// - [`SyncError::MalformedChangeSet`] for anything else: truncated JSON,
///   missing fields, invalid identifiers, or content that disagrees with the
///   file name
pub fn decode_change_set(file: &str, bytes: &[u8]) -> SyncResult<ChangeSet> {
    let malformed = |reason: String| SyncError::MalformedChangeSet {
        file: file.to_string(),
        reason,
    };

    // Check the version before the full shape so a newer layout is reported
    // as incompatible rather than as garbage.
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let found = value
        .get("protocol_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| malformed("missing protocol_version".into()))?;
    if found != u64::from(PROTOCOL_VERSION) {
        return Err(SyncError::IncompatibleProtocolVersion {
            file: file.to_string(),
            found: u32::try_from(found).unwrap_or(u32::MAX),
            supported: PROTOCOL_VERSION,
        });
    }

    let change_set: ChangeSet =
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    validate_change_set(&change_set).map_err(|e| malformed(e.to_string()))?;

    if let Some((device_id, sequence)) = parse_change_set_file_name(file) {
        if device_id != change_set.device_id || sequence != change_set.sequence {
            return Err(malformed(format!(
                "content is {}#{} but file name says {}#{}",
                change_set.device_id, change_set.sequence, device_id, sequence
            )));
        }
    }

    Ok(change_set)
}

// =============================================================================
// Acknowledgment File
// =============================================================================

/// Which peer Change Sets a device has incorporated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFile {
    pub protocol_version: u32,
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
    /// Peer device → highest sequence incorporated.
    pub incorporated: BTreeMap<String, u64>,
    /// Own Change Sets at or below this sequence have been deleted.
    #[serde(default)]
    pub pruned_through: u64,
}

impl AckFile {
    pub fn new(
        device_id: impl Into<String>,
        updated_at: DateTime<Utc>,
        incorporated: BTreeMap<String, u64>,
    ) -> Self {
        AckFile {
            protocol_version: PROTOCOL_VERSION,
            device_id: device_id.into(),
            updated_at,
            incorporated,
            pruned_through: 0,
        }
    }

    pub fn with_pruned_through(mut self, sequence: u64) -> Self {
        self.pruned_through = sequence;
        self
    }

    /// Highest sequence of `peer` this device has incorporated.
    pub fn acknowledged(&self, peer: &str) -> u64 {
        self.incorporated.get(peer).copied().unwrap_or(0)
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(file: &str, bytes: &[u8]) -> SyncResult<Self> {
        let ack: AckFile =
            serde_json::from_slice(bytes).map_err(|e| SyncError::MalformedChangeSet {
                file: file.to_string(),
                reason: e.to_string(),
            })?;
        if ack.protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::IncompatibleProtocolVersion {
                file: file.to_string(),
                found: ack.protocol_version,
                supported: PROTOCOL_VERSION,
            });
        }
        Ok(ack)
    }
}
