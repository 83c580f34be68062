//! # Outbox
//!
//! Turns local changes since the watermark into this round's Change Set and
//! publishes it to the shared folder.
//!
//! ## Publishing Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Outbox Flow                                     │
//! │                                                                         │
//! │  1. Collect: for each synced table (in dependency order)               │
//! │              records_changed_since(table, watermark)                   │
//! │              → live versions and tombstones, ordered by record_id      │
//! │                                                                         │
//! │  2. Number:  sequence = max(own files in folder, persisted) + 1        │
//! │                                                                         │
//! │  3. Write:   create_exclusive(changes/<device>.<seq>.json)             │
//! │              never overwrites; a name collision bumps the sequence     │
//! │                                                                         │
//! │  An empty delta publishes nothing.                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use wiredpart_core::{ChangeSet, Record};

use crate::error::{SyncError, SyncResult};
use crate::folder::SyncFolder;
use crate::protocol::{change_set_path, encode_change_set, parse_change_set_file_name, CHANGES_DIR};
use crate::store::RecordStore;

/// Attempts at finding a free file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 3;

/// A Change Set that made it to the folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedChangeSet {
    pub path: String,
    pub sequence: u64,
    pub records: usize,
}

/// Collects and publishes this device's local changes.
pub struct Outbox {
    folder: Arc<dyn SyncFolder>,
    records: Arc<dyn RecordStore>,
    tables: Vec<String>,
}

impl Outbox {
    pub fn new(folder: Arc<dyn SyncFolder>, records: Arc<dyn RecordStore>, tables: Vec<String>) -> Self {
        Outbox {
            folder,
            records,
            tables,
        }
    }

    /// Local versions changed after `since`, per table, in table order.
    /// Tables without changes are omitted.
    pub async fn collect_local_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<(String, Vec<Record>)>> {
        let mut changes = Vec::new();
        for table in &self.tables {
            let records = self.records.records_changed_since(table, since).await?;
            if !records.is_empty() {
                debug!(table = %table, count = records.len(), "Collected local changes");
                changes.push((table.clone(), records));
            }
        }
        Ok(changes)
    }

    /// Builds this round's Change Set without writing it.
    pub async fn build_change_set(
        &self,
        device_id: &str,
        sequence: u64,
        created_at: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<ChangeSet> {
        let mut change_set = ChangeSet::new(device_id, sequence, created_at);
        for (table, records) in self.collect_local_changes(since).await? {
            change_set.push_table(table, records);
        }
        Ok(change_set)
    }

    /// Next free sequence for `device_id`.
    ///
    /// Looks at the folder as well as the persisted sequence so a device
    /// restored from an old backup never reuses a published name.
    pub async fn next_sequence(&self, device_id: &str, persisted: u64) -> SyncResult<u64> {
        let highest_in_folder = self
            .folder
            .list(CHANGES_DIR)
            .await?
            .iter()
            .filter_map(|entry| parse_change_set_file_name(&entry.name))
            .filter(|(device, _)| device == device_id)
            .map(|(_, seq)| seq)
            .max()
            .unwrap_or(0);
        Ok(highest_in_folder.max(persisted) + 1)
    }

    /// Writes `change_set` as a new immutable file.
    ///
    /// If the name is already taken the sequence is bumped and the write
    /// retried, so an existing file is never replaced.
    pub async fn write_change_set(&self, change_set: &mut ChangeSet) -> SyncResult<PublishedChangeSet> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = change_set_path(&change_set.device_id, change_set.sequence);
            let bytes = encode_change_set(change_set)?;

            if self.folder.create_exclusive(&path, &bytes).await? {
                info!(
                    path = %path,
                    records = change_set.record_count(),
                    "Published change set"
                );
                return Ok(PublishedChangeSet {
                    path,
                    sequence: change_set.sequence,
                    records: change_set.record_count(),
                });
            }

            warn!(path = %path, "Change set name already taken, bumping sequence");
            change_set.sequence += 1;
        }

        Err(SyncError::Internal(format!(
            "no free change set name for device {}",
            change_set.device_id
        )))
    }
}
