//! # Sync Engine
//!
//! Runs one sync round end to end.
//!
//! ## Round Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Sync Round                                    │
//! │                                                                         │
//! │   re-entrancy guard ──► configured? ──► load state ──► folder root     │
//! │                                                        reachable?      │
//! │                                                            │           │
//! │   ┌────────────────────────────────────────────────────────▼────────┐  │
//! │   │ LOCK HELD                                                       │  │
//! │   │  1. local delta      records_changed_since(watermark)           │  │
//! │   │  2. publish          changes/<device>.<seq>.json   (not pull)   │  │
//! │   │  3. collect          peer files above their cursors (not push)  │  │
//! │   │  4. merge            LWW with tombstones, count conflicts       │  │
//! │   │  5. commit           apply winners, then ONE state commit:      │  │
//! │   │                      watermark = round start - 1ms, cursors     │  │
//! │   │  6. gc + ack         best effort                                │  │
//! │   └────────────────────────────────────────────────────────┬────────┘  │
//! │                                                            ▼           │
//! │                                                      release lock      │
//! │                                                                         │
//! │  Any failure before step 5 leaves records, watermark and cursors       │
//! │  untouched; the error is recorded as last_error for status.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use wiredpart_core::{
    truncate_to_millis, ChangeSet, LastError, LocalState, Merger, RecordKey, RoundCommit, SyncHealth,
    SyncState,
};
use wiredpart_db::Database;

use crate::apply::CommitStage;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::folder::{FsFolder, SyncFolder};
use crate::gc::GarbageCollector;
use crate::inbound::{PeerChanges, PeerCollector, SkippedFile};
use crate::lock::{LockCoordinator, LockHandle};
use crate::outbox::{Outbox, PublishedChangeSet};
use crate::status::{current_health, folder_overview, PeerSummary};
use crate::store::{RecordStore, SyncStateStore};

// =============================================================================
// Round Mode & Report
// =============================================================================

/// Which halves of a round to run. All modes take the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundMode {
    /// Publish local changes, then merge peers.
    Full,
    /// Export only: publish local changes and advance the watermark.
    PublishOnly,
    /// Import only: merge peers; the watermark does not move.
    PullOnly,
}

impl RoundMode {
    fn publishes(self) -> bool {
        self != RoundMode::PullOnly
    }

    fn pulls(self) -> bool {
        self != RoundMode::PublishOnly
    }
}

impl fmt::Display for RoundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundMode::Full => write!(f, "full"),
            RoundMode::PublishOnly => write!(f, "publish-only"),
            RoundMode::PullOnly => write!(f, "pull-only"),
        }
    }
}

/// Summary of a successful round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub device_id: String,
    pub mode: RoundMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// This round's Change Set, if there was anything to publish.
    pub published: Option<PublishedChangeSet>,
    pub peers_read: usize,
    pub change_sets_read: usize,
    pub skipped: Vec<SkippedFile>,
    /// Table → records written to the local store.
    pub written_by_table: BTreeMap<String, usize>,
    pub records_written: usize,
    pub conflicts: usize,
    pub gc_deleted: usize,
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Runs sync rounds for one device.
///
/// All durable state comes in through the store traits, so any number of
/// engines (simulated devices) can share a process.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    folder: Arc<dyn SyncFolder>,
    records: Arc<dyn RecordStore>,
    state: Arc<dyn SyncStateStore>,
    /// Held for the whole round; a second caller gets `RoundInProgress`.
    guard: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        folder: Arc<dyn SyncFolder>,
        records: Arc<dyn RecordStore>,
        state: Arc<dyn SyncStateStore>,
    ) -> Self {
        SyncEngine {
            config: Arc::new(config),
            folder,
            records,
            state,
            guard: Mutex::new(()),
        }
    }

    /// Engine over the configured shared folder and a local database.
    pub fn with_database(config: SyncConfig, db: &Database) -> Self {
        let folder = FsFolder::new(
            config.sync.folder_path.clone().unwrap_or_default(),
            &config.sync.channel,
            config.io_timeout(),
        );
        Self::new(
            config,
            Arc::new(folder),
            Arc::new(db.records()),
            Arc::new(db.sync_state()),
        )
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync is enabled, a folder is set, and its root is reachable now.
    pub async fn is_configured(&self) -> bool {
        self.config.is_configured() && self.folder.check_root().await.is_ok()
    }

    /// Full round: publish, then merge.
    pub async fn sync(&self) -> SyncResult<RoundReport> {
        self.run_round(RoundMode::Full).await
    }

    pub async fn publish_only(&self) -> SyncResult<RoundReport> {
        self.run_round(RoundMode::PublishOnly).await
    }

    pub async fn pull_only(&self) -> SyncResult<RoundReport> {
        self.run_round(RoundMode::PullOnly).await
    }

    /// Current health, derived from durable state.
    pub async fn health(&self) -> SyncResult<SyncHealth> {
        current_health(&self.config, self.records.as_ref(), self.state.as_ref(), Utc::now()).await
    }

    /// Every device with Change Sets in the folder.
    pub async fn peers(&self) -> SyncResult<Vec<PeerSummary>> {
        self.ensure_configured()?;
        self.folder.check_root().await?;
        folder_overview(self.folder.as_ref()).await
    }

    /// Runs one round.
    ///
    /// ## Errors
    /// - [`SyncError::RoundInProgress`] if this device is already syncing
    /// - [`SyncError::NotConfigured`] if sync is disabled or has no folder
    /// - [`SyncError::LockFolderUnreachable`] / [`SyncError::FolderTimeout`]
    ///   ("offline") and [`SyncError::LockBusy`] ("deferred"): nothing was
    ///   changed
    /// - [`SyncError::CommitFailure`]: some winners may be written; the
    ///   watermark is unchanged and the next round re-applies
    pub async fn run_round(&self, mode: RoundMode) -> SyncResult<RoundReport> {
        let _guard = self.guard.try_lock().map_err(|_| SyncError::RoundInProgress)?;
        self.ensure_configured()?;

        let started_at = truncate_to_millis(Utc::now());
        let result = self.run_locked(mode, started_at).await;

        match &result {
            Ok(report) => {
                info!(
                    mode = %mode,
                    published = report.published.as_ref().map_or(0, |p| p.records),
                    peers = report.peers_read,
                    written = report.records_written,
                    conflicts = report.conflicts,
                    skipped = report.skipped.len(),
                    "Sync round complete"
                );
            }
            Err(e) => self.record_failure(e).await,
        }
        result
    }

    fn ensure_configured(&self) -> SyncResult<()> {
        if !self.config.sync.enabled {
            return Err(SyncError::NotConfigured("sync is disabled".into()));
        }
        if !self.config.is_configured() {
            return Err(SyncError::NotConfigured("no sync folder is set".into()));
        }
        Ok(())
    }

    async fn record_failure(&self, err: &SyncError) {
        if err.is_offline() {
            info!(error = %err, "Sync round skipped: folder offline");
        } else if err.is_deferred() {
            info!(error = %err, "Sync round deferred");
        } else {
            error!(error = %err, outcome = err.outcome_label(), "Sync round failed");
        }

        let last_error = LastError {
            kind: err.kind(),
            message: err.to_string(),
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.state.record_error(&last_error).await {
            warn!(error = %e, "Failed to record sync error");
        }
    }

    async fn run_locked(&self, mode: RoundMode, started_at: DateTime<Utc>) -> SyncResult<RoundReport> {
        let state = self.state.load_state().await?;
        let device_id = self
            .config
            .device_id_override()
            .map(str::to_string)
            .unwrap_or_else(|| state.device_id.clone());

        debug!(device_id = %device_id, mode = %mode, "Starting sync round");
        self.folder.check_root().await?;

        let lock = LockCoordinator::new(self.folder.clone(), &device_id, self.config.lock.clone());
        let handle = lock.acquire().await?;

        let result = self
            .round_body(mode, &device_id, &state, started_at, &lock, &handle)
            .await;

        if let Err(e) = lock.release(handle).await {
            warn!(error = %e, "Failed to release sync lock; it will expire as stale");
        }
        result
    }

    async fn round_body(
        &self,
        mode: RoundMode,
        device_id: &str,
        state: &SyncState,
        started_at: DateTime<Utc>,
        lock: &LockCoordinator,
        handle: &LockHandle,
    ) -> SyncResult<RoundReport> {
        // 1. Local delta
        let outbox = Outbox::new(
            self.folder.clone(),
            self.records.clone(),
            self.config.sync.tables.clone(),
        );
        let sequence = outbox
            .next_sequence(device_id, state.published_sequence)
            .await?;
        let mut own = outbox
            .build_change_set(device_id, sequence, started_at, state.watermark)
            .await?;

        // 2. Publish
        let mut published = None;
        if mode.publishes() {
            if own.is_empty() {
                debug!("No local changes to publish");
            } else {
                lock.ensure_held(handle).await?;
                published = Some(outbox.write_change_set(&mut own).await?);
            }
        }

        // 3. Collect
        let peers = if mode.pulls() {
            PeerCollector::new(self.folder.clone())
                .collect_peer_change_sets(device_id, &state.peer_cursors)
                .await?
        } else {
            PeerChanges::default()
        };

        // 4. Merge
        let outcome = {
            let local = self.local_state_for(&own, &peers).await?;
            let mut merger = Merger::with_local_state(local);
            merger.add_change_set(&own);
            for change_set in peers.change_sets() {
                merger.add_change_set(change_set);
            }
            merger.finish()
        };
        if outcome.conflict_count() > 0 {
            debug!(conflicts = outcome.conflict_count(), "Resolved concurrent edits");
        }

        // 5. Commit
        lock.ensure_held(handle).await?;
        // A local edit stamped in the round's first millisecond may postdate
        // the delta query, so the watermark sits just before it.
        let watermark = started_at - Duration::milliseconds(1);
        let round = RoundCommit {
            watermark: mode.publishes().then_some(watermark),
            completed_at: Utc::now(),
            conflicts: outcome.conflict_count() as u64,
            published_sequence: published.as_ref().map(|p| p.sequence),
            peer_cursors: peers.cursors.clone(),
        };
        let summary = CommitStage::new(self.records.clone(), self.state.clone())
            .commit(&outcome, &round)
            .await?;

        // 6. Acknowledge and prune
        let gc_deleted = self.acknowledge_and_prune(device_id, state, &peers).await;

        Ok(RoundReport {
            device_id: device_id.to_string(),
            mode,
            started_at,
            finished_at: Utc::now(),
            published,
            peers_read: peers.peer_count(),
            change_sets_read: peers.change_set_count(),
            skipped: peers.skipped,
            written_by_table: summary.written_by_table,
            records_written: summary.records_written,
            conflicts: outcome.conflict_count(),
            gc_deleted,
        })
    }

    /// Current local versions of every record this round touches.
    async fn local_state_for(&self, own: &ChangeSet, peers: &PeerChanges) -> SyncResult<LocalState> {
        let mut local = LocalState::new();
        for record in own.records() {
            local.insert(record.key(), record.clone());
        }

        let mut looked_up: BTreeSet<RecordKey> = BTreeSet::new();
        for record in peers.change_sets().flat_map(|cs| cs.records()) {
            let key = record.key();
            if local.contains_key(&key) || !looked_up.insert(key.clone()) {
                continue;
            }
            if let Some(current) = self
                .records
                .get_record(&record.table_name, &record.record_id)
                .await?
            {
                local.insert(key, current);
            }
        }
        Ok(local)
    }

    /// Prunes this device's own Change Sets, then publishes its
    /// acknowledgment. Failures are logged, never fatal: the round is
    /// committed.
    async fn acknowledge_and_prune(&self, device_id: &str, state: &SyncState, peers: &PeerChanges) -> usize {
        let gc = GarbageCollector::new(
            self.folder.clone(),
            device_id,
            self.config.min_change_set_age(),
        );

        let mut incorporated = state.peer_cursors.clone();
        for (peer, seq) in &peers.cursors {
            let cursor = incorporated.entry(peer.clone()).or_insert(0);
            *cursor = (*cursor).max(*seq);
        }

        let now = Utc::now();
        let mut deleted = 0;
        let pruned_through = if self.config.retention.gc_enabled {
            match gc.collect_garbage(now).await {
                Ok(report) => {
                    deleted = report.deleted.len();
                    Ok(report.pruned_through)
                }
                Err(e) => {
                    warn!(error = %e, "Change set garbage collection failed");
                    gc.pruned_through().await
                }
            }
        } else {
            gc.pruned_through().await
        };
        let pruned_through = match pruned_through {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!(error = %e, "Failed to publish acknowledgment");
                return deleted;
            }
        };

        // After pruning: pruned_through must cover every deleted file.
        if let Err(e) = gc.publish_ack(&incorporated, pruned_through, now).await {
            warn!(error = %e, "Failed to publish acknowledgment");
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::MemoryFolder;
    use crate::store::MemoryStore;
    use wiredpart_core::{ErrorKind, Fields};

    fn engine(folder: &MemoryFolder, store: &MemoryStore) -> SyncEngine {
        let mut config = SyncConfig::for_folder("/shared");
        config.sync.tables = vec!["parts".into()];
        config.lock.timeout_secs = 1;
        config.lock.initial_backoff_ms = 10;
        config.lock.max_backoff_ms = 20;
        SyncEngine::new(
            config,
            Arc::new(folder.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )
    }

    #[tokio::test]
    async fn test_not_configured_touches_nothing() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        let engine = SyncEngine::new(
            SyncConfig::default(),
            Arc::new(folder.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );

        assert!(!engine.is_configured().await);
        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured(_)));
        assert!(store.state().await.last_error.is_none());
        assert!(folder.paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_round_in_progress_is_rejected() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        let engine = engine(&folder, &store);

        let _held = engine.guard.try_lock().unwrap();
        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::RoundInProgress));
    }

    #[tokio::test]
    async fn test_first_round_publishes_and_releases_lock() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        store
            .upsert_local("parts", "P-1", Fields::new(), Utc::now() - Duration::seconds(1))
            .await;
        let engine = engine(&folder, &store);

        assert!(engine.is_configured().await);
        let report = engine.sync().await.unwrap();
        let published = report.published.unwrap();
        assert_eq!(published.sequence, 1);
        assert_eq!(published.records, 1);
        assert_eq!(report.records_written, 0);

        let state = store.state().await;
        assert_eq!(
            state.watermark,
            Some(report.started_at - Duration::milliseconds(1))
        );
        assert_eq!(state.published_sequence, 1);
        assert!(!folder.paths().await.iter().any(|p| p == crate::lock::LOCK_FILE));

        // Nothing new: no second file.
        let report = engine.sync().await.unwrap();
        assert!(report.published.is_none());
        assert_eq!(engine.health().await.unwrap().pending_local_changes, 0);
    }

    #[tokio::test]
    async fn test_pull_only_keeps_watermark_and_publishes_nothing() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        store
            .upsert_local("parts", "P-1", Fields::new(), Utc::now() - Duration::seconds(1))
            .await;
        let engine = engine(&folder, &store);

        let report = engine.pull_only().await.unwrap();
        assert!(report.published.is_none());
        let state = store.state().await;
        assert!(state.watermark.is_none());
        assert!(state.last_sync_at.is_some());
        assert_eq!(engine.health().await.unwrap().pending_local_changes, 1);
    }

    #[tokio::test]
    async fn test_offline_round_records_error_only() {
        let folder = MemoryFolder::new();
        let store = MemoryStore::with_device_id("dev-a");
        store
            .upsert_local("parts", "P-1", Fields::new(), Utc::now() - Duration::seconds(1))
            .await;
        let engine = engine(&folder, &store);
        folder.set_online(false);

        let err = engine.sync().await.unwrap_err();
        assert!(err.is_offline());
        let state = store.state().await;
        assert!(state.watermark.is_none());
        assert_eq!(state.last_error.unwrap().kind, ErrorKind::Offline);
    }
}
