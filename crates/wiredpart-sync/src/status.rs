//! # Status Reporter
//!
//! Derives [`SyncHealth`] from durable state and summarizes what other
//! devices have left in the shared folder.
//!
//! Health is computed from the store on demand; nothing here is cached, so
//! a status read after a restart is as accurate as one taken mid-session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wiredpart_core::{derive_health, SyncHealth};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::folder::SyncFolder;
use crate::protocol::{
    change_set_file_name, change_set_path, decode_change_set, parse_change_set_file_name, CHANGES_DIR,
};
use crate::store::{RecordStore, SyncStateStore};

/// Current health of this device.
///
/// `pending_local_changes` is the change log reader run against the
/// current watermark, across every synced table.
pub async fn current_health(
    config: &SyncConfig,
    records: &dyn RecordStore,
    state: &dyn SyncStateStore,
    now: DateTime<Utc>,
) -> SyncResult<SyncHealth> {
    let state = state.load_state().await?;
    let pending = records
        .count_changed_since(&config.sync.tables, state.watermark)
        .await?;
    Ok(derive_health(state.status_inputs(pending), now, config.stale_after()))
}

/// What one device has published to the folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub device_id: String,
    pub latest_sequence: u64,
    /// `created_at` of the latest Change Set, if it decodes.
    pub latest_created_at: Option<DateTime<Utc>>,
    /// Modification time of the latest file, as reported by the folder.
    pub latest_modified: Option<DateTime<Utc>>,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Lists every device with Change Sets in the folder, this one included.
pub async fn folder_overview(folder: &dyn SyncFolder) -> SyncResult<Vec<PeerSummary>> {
    let mut by_device: BTreeMap<String, PeerSummary> = BTreeMap::new();

    for entry in folder.list(CHANGES_DIR).await? {
        let Some((device_id, sequence)) = parse_change_set_file_name(&entry.name) else {
            continue;
        };
        let summary = by_device
            .entry(device_id.clone())
            .or_insert_with(|| PeerSummary {
                device_id,
                latest_sequence: 0,
                latest_created_at: None,
                latest_modified: None,
                file_count: 0,
                total_bytes: 0,
            });
        summary.file_count += 1;
        summary.total_bytes += entry.size;
        if sequence >= summary.latest_sequence {
            summary.latest_sequence = sequence;
            summary.latest_modified = entry.modified;
        }
    }

    for summary in by_device.values_mut() {
        let path = change_set_path(&summary.device_id, summary.latest_sequence);
        if let Some(bytes) = folder.read(&path).await? {
            let name = change_set_file_name(&summary.device_id, summary.latest_sequence);
            summary.latest_created_at = decode_change_set(&name, &bytes).ok().map(|cs| cs.created_at);
        }
    }

    Ok(by_device.into_values().collect())
}
