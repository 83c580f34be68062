//! # Peer Change Collector
//!
//! Discovers and decodes every peer Change Set this device has not
//! incorporated yet.
//!
//! ## Collection Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Peer Change Collection                               │
//! │                                                                         │
//! │  changes/                                                               │
//! │    dev-a.000000000003.json   ← own device: excluded                    │
//! │    dev-b.000000000001.json   ← seq ≤ cursor(dev-b)=1: already merged   │
//! │    dev-b.000000000002.json   ← read                                    │
//! │    dev-b.000000000003.json   ← truncated: skipped, reported            │
//! │    dev-b.000000000004.json   ← read                                    │
//! │    dev-c.000000000001.json   ← protocol v2: skipped, "update the app"  │
//! │    notes.txt                 ← not a Change Set name: ignored          │
//! │                                                                         │
//! │  Cursor advance (applied only on commit):                              │
//! │    dev-b → 2   stops before the first skipped file, so seq 3 is        │
//! │                retried next round once its write completes             │
//! │    dev-c → 0   unchanged                                               │
//! │                                                                         │
//! │  A cursor only crosses consecutive sequences. A missing sequence       │
//! │  (not yet arrived through the folder's own sync) stops it like a       │
//! │  skipped file. Sequences at or below the writer's acked                │
//! │  `pruned_through` count as present: they were garbage collected.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Files are returned oldest-to-newest per device. Nothing here depends on
//! the order devices are discovered in; the merge does not either.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use wiredpart_core::ChangeSet;

use crate::error::{SyncError, SyncResult};
use crate::folder::SyncFolder;
use crate::gc::read_acks;
use crate::protocol::{decode_change_set, parse_change_set_file_name, CHANGES_DIR};

/// Why a peer file was not incorporated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Truncated or otherwise unreadable.
    Malformed(String),
    /// Written by a different protocol version.
    IncompatibleVersion { found: u32, supported: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Malformed(reason) => write!(f, "malformed: {reason}"),
            SkipReason::IncompatibleVersion { found, supported } => write!(
                f,
                "protocol version {found} (this build speaks {supported}); update the app"
            ),
        }
    }
}

/// A peer file left out of this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub file: String,
    pub device_id: String,
    pub sequence: u64,
    pub reason: SkipReason,
}

/// Everything collected from peers in one round.
#[derive(Debug, Clone, Default)]
pub struct PeerChanges {
    /// Peer device → its unread Change Sets, oldest first.
    pub by_device: BTreeMap<String, Vec<ChangeSet>>,

    pub skipped: Vec<SkippedFile>,

    /// Cursors to commit if the round succeeds. Contains only peers whose
    /// cursor moves.
    pub cursors: BTreeMap<String, u64>,
}

impl PeerChanges {
    /// Every collected Change Set.
    pub fn change_sets(&self) -> impl Iterator<Item = &ChangeSet> {
        self.by_device.values().flatten()
    }

    pub fn change_set_count(&self) -> usize {
        self.by_device.values().map(Vec::len).sum()
    }

    pub fn peer_count(&self) -> usize {
        self.by_device.len()
    }
}

/// Reads peer Change Sets from the shared folder.
pub struct PeerCollector {
    folder: Arc<dyn SyncFolder>,
}

impl PeerCollector {
    pub fn new(folder: Arc<dyn SyncFolder>) -> Self {
        PeerCollector { folder }
    }

    /// Collects every peer Change Set above its cursor.
    ///
    /// Malformed and incompatible files are skipped and reported; only a
    /// folder failure aborts collection.
    pub async fn collect_peer_change_sets(
        &self,
        exclude_device_id: &str,
        cursors: &BTreeMap<String, u64>,
    ) -> SyncResult<PeerChanges> {
        let entries = self.folder.list(CHANGES_DIR).await?;
        let acks = read_acks(self.folder.as_ref()).await?;

        let mut pending: BTreeMap<String, Vec<(u64, String)>> = BTreeMap::new();
        for entry in entries {
            let Some((device_id, sequence)) = parse_change_set_file_name(&entry.name) else {
                debug!(file = %entry.name, "Ignoring non change set file");
                continue;
            };
            if device_id == exclude_device_id {
                continue;
            }
            let cursor = cursors.get(&device_id).copied().unwrap_or(0);
            if sequence <= cursor {
                continue;
            }
            pending.entry(device_id).or_default().push((sequence, entry.name));
        }

        let mut collected = PeerChanges::default();
        for (device_id, mut files) in pending {
            files.sort();
            let cursor = cursors.get(&device_id).copied().unwrap_or(0);
            let pruned = acks.get(&device_id).map_or(0, |ack| ack.pruned_through);
            let mut frontier = cursor.max(pruned);
            let mut blocked = false;

            for (sequence, name) in files {
                let path = format!("{CHANGES_DIR}/{name}");
                let Some(bytes) = self.folder.read(&path).await? else {
                    // Deleted between list and read.
                    if !blocked && sequence > frontier {
                        blocked = true;
                    }
                    continue;
                };

                match decode_change_set(&name, &bytes) {
                    Ok(change_set) => {
                        if !blocked && sequence > frontier {
                            if sequence == frontier + 1 {
                                frontier = sequence;
                            } else {
                                debug!(
                                    device = %device_id,
                                    expected = frontier + 1,
                                    found = sequence,
                                    "Sequence gap; cursor waits for the missing change set"
                                );
                                blocked = true;
                            }
                        }
                        collected
                            .by_device
                            .entry(device_id.clone())
                            .or_default()
                            .push(change_set);
                    }
                    Err(err) => {
                        let reason = match err {
                            SyncError::IncompatibleProtocolVersion { found, supported, .. } => {
                                warn!(
                                    file = %name,
                                    found,
                                    supported,
                                    "Skipping change set from a different app version; update the app"
                                );
                                SkipReason::IncompatibleVersion { found, supported }
                            }
                            other => {
                                warn!(file = %name, error = %other, "Skipping malformed change set");
                                SkipReason::Malformed(other.to_string())
                            }
                        };
                        if sequence > frontier {
                            blocked = true;
                        }
                        collected.skipped.push(SkippedFile {
                            file: name,
                            device_id: device_id.clone(),
                            sequence,
                            reason,
                        });
                    }
                }
            }

            if frontier > cursor {
                collected.cursors.insert(device_id, frontier);
            }
        }

        debug!(
            peers = collected.peer_count(),
            change_sets = collected.change_set_count(),
            skipped = collected.skipped.len(),
            "Collected peer change sets"
        );
        Ok(collected)
    }
}
