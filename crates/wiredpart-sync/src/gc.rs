//! # Change Set Garbage Collection
//!
//! Change Sets are immutable and would pile up forever. After every
//! committed round a device publishes an acknowledgment file, and deletes
//! those of its *own* Change Sets that every known peer has acknowledged.
//!
//! ## Deletion Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  own file changes/dev-a.<seq>.json is deleted only if ALL hold:        │
//! │                                                                         │
//! │  • at least one peer is known (has an ack file or a change set)        │
//! │  • every known peer's ack lists dev-a ≥ seq                            │
//! │  • the file is older than retention.min_age_hours                      │
//! │  • every older own file is already gone                                │
//! │                                                                         │
//! │  The ack records the highest pruned sequence as `pruned_through`, so   │
//! │  readers can tell a pruned file from one that has not arrived yet.     │
//! │                                                                         │
//! │  A peer that never published anything is unknown; a device joining    │
//! │  after deletion starts from the remaining files plus later rounds.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::folder::SyncFolder;
use crate::protocol::{ack_path, parse_ack_file_name, parse_change_set_file_name, AckFile, ACKS_DIR, CHANGES_DIR};

/// Result of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: Vec<String>,
    /// Own files kept because a peer has not acknowledged them yet (or
    /// they are too young).
    pub retained: usize,
    /// Highest own sequence known to be pruned, this pass or earlier.
    pub pruned_through: u64,
}

/// Every readable acknowledgment file in the folder, keyed by device.
pub async fn read_acks(folder: &dyn SyncFolder) -> SyncResult<BTreeMap<String, AckFile>> {
    let mut acks = BTreeMap::new();
    for entry in folder.list(ACKS_DIR).await? {
        let Some(device_id) = parse_ack_file_name(&entry.name) else {
            continue;
        };
        let Some(bytes) = folder.read(&ack_path(&device_id)).await? else {
            continue;
        };
        match AckFile::decode(&entry.name, &bytes) {
            Ok(ack) => {
                acks.insert(device_id, ack);
            }
            Err(e) => warn!(file = %entry.name, error = %e, "Ignoring unreadable ack file"),
        }
    }
    Ok(acks)
}

/// Publishes acknowledgments and prunes this device's Change Sets.
pub struct GarbageCollector {
    folder: Arc<dyn SyncFolder>,
    device_id: String,
    min_age: ChronoDuration,
}

impl GarbageCollector {
    pub fn new(folder: Arc<dyn SyncFolder>, device_id: impl Into<String>, min_age: ChronoDuration) -> Self {
        GarbageCollector {
            folder,
            device_id: device_id.into(),
            min_age,
        }
    }

    /// Replaces this device's acknowledgment file.
    pub async fn publish_ack(
        &self,
        incorporated: &BTreeMap<String, u64>,
        pruned_through: u64,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let ack = AckFile::new(&self.device_id, now, incorporated.clone())
            .with_pruned_through(pruned_through);
        self.folder
            .write_atomic(&ack_path(&self.device_id), &ack.encode()?)
            .await?;
        debug!(peers = incorporated.len(), pruned_through, "Published acknowledgment");
        Ok(())
    }

    /// `pruned_through` from this device's current acknowledgment file.
    pub async fn pruned_through(&self) -> SyncResult<u64> {
        let Some(bytes) = self.folder.read(&ack_path(&self.device_id)).await? else {
            return Ok(0);
        };
        match AckFile::decode(&ack_path(&self.device_id), &bytes) {
            Ok(ack) => Ok(ack.pruned_through),
            Err(e) => {
                warn!(error = %e, "Own ack file unreadable; pruning restarts from zero");
                Ok(0)
            }
        }
    }

    /// Deletes own Change Sets acknowledged by every known peer.
    pub async fn collect_garbage(&self, now: DateTime<Utc>) -> SyncResult<GcReport> {
        let changes = self.folder.list(CHANGES_DIR).await?;
        let acks = read_acks(self.folder.as_ref()).await?;

        let mut peers: BTreeSet<String> = acks
            .keys()
            .filter(|device| **device != self.device_id)
            .cloned()
            .collect();
        peers.extend(
            changes
                .iter()
                .filter_map(|e| parse_change_set_file_name(&e.name))
                .map(|(device, _)| device)
                .filter(|device| *device != self.device_id),
        );

        let mut report = GcReport {
            pruned_through: acks
                .get(&self.device_id)
                .map_or(0, |ack| ack.pruned_through),
            ..GcReport::default()
        };
        let mut own: Vec<_> = changes
            .iter()
            .filter_map(|e| parse_change_set_file_name(&e.name).map(|(d, s)| (d, s, e)))
            .filter(|(device, _, _)| *device == self.device_id)
            .collect();
        own.sort_by_key(|(_, sequence, _)| *sequence);

        if peers.is_empty() {
            report.retained = own.len();
            return Ok(report);
        }

        // Lowest sequence of ours any peer has incorporated.
        let acknowledged_by_all = peers
            .iter()
            .map(|peer| acks.get(peer).map_or(0, |ack| ack.acknowledged(&self.device_id)))
            .min()
            .unwrap_or(0);

        let mut first_kept: Option<u64> = None;
        for (_, sequence, entry) in own {
            let old_enough = entry
                .modified
                .is_some_and(|modified| now.signed_duration_since(modified) >= self.min_age);
            if first_kept.is_some() || sequence > acknowledged_by_all || !old_enough {
                first_kept.get_or_insert(sequence);
                report.retained += 1;
                continue;
            }

            let path = format!("{CHANGES_DIR}/{}", entry.name);
            if self.folder.delete(&path).await? {
                report.deleted.push(path);
            }
        }

        // Everything below the first kept file is gone, whether deleted now
        // or in a pass whose ack never got written.
        let gone_through = first_kept.map_or(acknowledged_by_all, |kept| {
            kept.saturating_sub(1).min(acknowledged_by_all)
        });
        report.pruned_through = report.pruned_through.max(gone_through);

        if !report.deleted.is_empty() {
            info!(
                deleted = report.deleted.len(),
                retained = report.retained,
                "Pruned acknowledged change sets"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::MemoryFolder;
    use crate::protocol::change_set_path;

    fn gc(folder: &MemoryFolder, device: &str, min_age_hours: i64) -> GarbageCollector {
        GarbageCollector::new(
            Arc::new(folder.clone()),
            device,
            ChronoDuration::hours(min_age_hours),
        )
    }

    async fn old_file(folder: &MemoryFolder, device: &str, seq: u64) {
        let path = change_set_path(device, seq);
        folder.put_raw(&path, "{}").await;
        folder
            .set_modified(&path, Utc::now() - ChronoDuration::days(30))
            .await;
    }

    async fn ack(folder: &MemoryFolder, device: &str, of: &str, seq: u64) {
        let mut incorporated = BTreeMap::new();
        incorporated.insert(of.to_string(), seq);
        gc(folder, device, 0).publish_ack(&incorporated, 0, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_deletes_only_what_every_peer_acknowledged() {
        let folder = MemoryFolder::new();
        for seq in 1..=3 {
            old_file(&folder, "dev-a", seq).await;
        }
        old_file(&folder, "dev-b", 1).await;
        ack(&folder, "dev-b", "dev-a", 3).await;
        ack(&folder, "dev-c", "dev-a", 2).await;

        let report = gc(&folder, "dev-a", 24).collect_garbage(Utc::now()).await.unwrap();
        assert_eq!(
            report.deleted,
            vec![change_set_path("dev-a", 1), change_set_path("dev-a", 2)]
        );
        assert_eq!(report.retained, 1);
        assert_eq!(report.pruned_through, 2);

        // Never touches a peer's files.
        assert!(folder.read(&change_set_path("dev-b", 1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unacknowledged_peer_blocks_deletion() {
        let folder = MemoryFolder::new();
        old_file(&folder, "dev-a", 1).await;
        ack(&folder, "dev-b", "dev-a", 1).await;
        // dev-c published but never acknowledged anything.
        old_file(&folder, "dev-c", 1).await;

        let report = gc(&folder, "dev-a", 0).collect_garbage(Utc::now()).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.retained, 1);
    }

    #[tokio::test]
    async fn test_no_peers_and_young_files_are_kept() {
        let folder = MemoryFolder::new();
        old_file(&folder, "dev-a", 1).await;
        let report = gc(&folder, "dev-a", 0).collect_garbage(Utc::now()).await.unwrap();
        assert!(report.deleted.is_empty());

        folder.put_raw(&change_set_path("dev-a", 2), "{}").await;
        ack(&folder, "dev-b", "dev-a", 2).await;
        let report = gc(&folder, "dev-a", 24).collect_garbage(Utc::now()).await.unwrap();
        assert_eq!(report.deleted, vec![change_set_path("dev-a", 1)]);
        assert_eq!(report.retained, 1);
        assert_eq!(report.pruned_through, 1);
    }

    #[tokio::test]
    async fn test_pruning_stops_at_first_kept_file() {
        let folder = MemoryFolder::new();
        folder.put_raw(&change_set_path("dev-a", 1), "{}").await;
        old_file(&folder, "dev-a", 2).await;
        ack(&folder, "dev-b", "dev-a", 2).await;

        // Seq 1 is too young, so seq 2 stays too.
        let report = gc(&folder, "dev-a", 24).collect_garbage(Utc::now()).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.retained, 2);
        assert_eq!(report.pruned_through, 0);
    }

    #[tokio::test]
    async fn test_pruned_through_survives_in_own_ack() {
        let folder = MemoryFolder::new();
        let collector = gc(&folder, "dev-a", 0);
        assert_eq!(collector.pruned_through().await.unwrap(), 0);

        collector.publish_ack(&BTreeMap::new(), 5, Utc::now()).await.unwrap();
        assert_eq!(collector.pruned_through().await.unwrap(), 5);

        // A peer that has not caught up does not lower the mark.
        ack(&folder, "dev-b", "dev-a", 3).await;
        let report = collector.collect_garbage(Utc::now()).await.unwrap();
        assert_eq!(report.pruned_through, 5);
    }

    #[tokio::test]
    async fn test_pruned_through_recovers_from_a_lost_ack() {
        let folder = MemoryFolder::new();
        for seq in 1..=3 {
            old_file(&folder, "dev-a", seq).await;
        }
        ack(&folder, "dev-b", "dev-a", 2).await;
        let collector = gc(&folder, "dev-a", 24);
        collector.collect_garbage(Utc::now()).await.unwrap();

        // Own ack never written; the next pass still reports seqs 1-2 gone.
        assert_eq!(collector.pruned_through().await.unwrap(), 0);
        let report = collector.collect_garbage(Utc::now()).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.pruned_through, 2);
    }
}
