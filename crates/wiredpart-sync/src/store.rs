//! # Storage Seams
//!
//! The round engine reaches local storage only through two traits:
//!
//! - [`RecordStore`]: the change log reader plus guarded apply
//! - [`SyncStateStore`]: the device's durable [`SyncState`]
//!
//! Both are implemented by the SQLite repositories of `wiredpart-db` and by
//! [`MemoryStore`], which lets tests run several devices in one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use wiredpart_core::{
    supersedes, truncate_to_millis, Fields, LastError, Record, RecordKey, RoundCommit, SyncState,
};
use wiredpart_db::{RecordRepository, SyncStateRepository};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Traits
// =============================================================================

/// Local record storage as seen by the sync engine.
///
/// ## Precondition
/// `records_changed_since` must be monotonic: every local mutation gets a
/// version time strictly after the previous version of that record and no
/// earlier than the wall clock at the time of the write. The engine relies
/// on this to recompute a failed round's delta from the unchanged watermark.
///
/// Only local writes are changes. A version written by `apply_record` stops
/// being one until the record is edited or deleted locally again.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Versions of `table` written locally strictly after `since`,
    /// tombstones included, ordered by `record_id`.
    async fn records_changed_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<Record>>;

    /// Current version of one record.
    async fn get_record(&self, table: &str, record_id: &str) -> SyncResult<Option<Record>>;

    /// Writes `record` if it supersedes the stored version.
    async fn apply_record(&self, record: &Record) -> SyncResult<bool>;

    /// Number of local changes across `tables` made after `since`.
    async fn count_changed_since(
        &self,
        tables: &[String],
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<u64> {
        let mut total = 0u64;
        for table in tables {
            total += self.records_changed_since(table, since).await?.len() as u64;
        }
        Ok(total)
    }
}

/// Durable per-device sync state.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Loads the state, creating the device identity on first use.
    async fn load_state(&self) -> SyncResult<SyncState>;

    /// Persists a successful round atomically.
    async fn commit_round(&self, commit: &RoundCommit) -> SyncResult<()>;

    /// Records a failed round. Must not touch the watermark.
    async fn record_error(&self, error: &LastError) -> SyncResult<()>;
}

// =============================================================================
// SQLite Implementations
// =============================================================================

#[async_trait]
impl RecordStore for RecordRepository {
    async fn records_changed_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<Record>> {
        Ok(RecordRepository::records_changed_since(self, table, since).await?)
    }

    async fn get_record(&self, table: &str, record_id: &str) -> SyncResult<Option<Record>> {
        Ok(RecordRepository::get_record(self, table, record_id).await?)
    }

    async fn apply_record(&self, record: &Record) -> SyncResult<bool> {
        Ok(RecordRepository::apply_record(self, record).await?)
    }

    async fn count_changed_since(
        &self,
        tables: &[String],
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<u64> {
        Ok(RecordRepository::count_changed_since(self, tables, since).await?)
    }
}

#[async_trait]
impl SyncStateStore for SyncStateRepository {
    async fn load_state(&self) -> SyncResult<SyncState> {
        Ok(self.load().await?)
    }

    async fn commit_round(&self, commit: &RoundCommit) -> SyncResult<()> {
        Ok(SyncStateRepository::commit_round(self, commit).await?)
    }

    async fn record_error(&self, error: &LastError) -> SyncResult<()> {
        Ok(SyncStateRepository::record_error(self, error).await?)
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<RecordKey, Record>,
    /// Local write time of records changed on this device.
    local_changes: BTreeMap<RecordKey, DateTime<Utc>>,
    state: SyncState,
    /// Fail every apply once this many records have been written.
    fail_applies_after: Option<usize>,
    applied: usize,
}

/// Records and sync state of one simulated device, in memory.
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// A fresh device with a random id.
    pub fn new() -> Self {
        Self::with_device_id(Uuid::new_v4().to_string())
    }

    pub fn with_device_id(device_id: impl Into<String>) -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(MemoryInner {
                state: SyncState::new(device_id),
                ..Default::default()
            })),
        }
    }

    pub async fn device_id(&self) -> String {
        self.inner.lock().await.state.device_id.clone()
    }

    /// Records a local create or edit at `now`.
    pub async fn upsert_local(
        &self,
        table: &str,
        record_id: &str,
        fields: Fields,
        now: DateTime<Utc>,
    ) -> Record {
        let mut inner = self.inner.lock().await;
        let key = RecordKey::new(table, record_id);
        let stamp = next_stamp(inner.records.get(&key), now);
        let record = Record::live(table, record_id, fields, stamp, inner.state.device_id.clone());
        inner.local_changes.insert(key.clone(), stamp);
        inner.records.insert(key, record.clone());
        record
    }

    /// Replaces a record with a tombstone stamped at `now`.
    pub async fn delete_local(
        &self,
        table: &str,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<Record> {
        let mut inner = self.inner.lock().await;
        let key = RecordKey::new(table, record_id);
        let current = inner
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| SyncError::DatabaseError(format!("record not found: {key}")))?;
        if current.is_deleted() {
            return Ok(current);
        }
        let stamp = next_stamp(Some(&current), now);
        let tombstone = Record::tombstone(table, record_id, stamp, inner.state.device_id.clone());
        inner.local_changes.insert(key.clone(), stamp);
        inner.records.insert(key, tombstone.clone());
        Ok(tombstone)
    }

    /// Every stored version, tombstones included.
    pub async fn snapshot(&self) -> BTreeMap<RecordKey, Record> {
        self.inner.lock().await.records.clone()
    }

    pub async fn state(&self) -> SyncState {
        self.inner.lock().await.state.clone()
    }

    /// Makes `apply_record` fail once `count` more records have been
    /// written. `None` clears the fault.
    pub async fn fail_applies_after(&self, count: Option<usize>) {
        let mut inner = self.inner.lock().await;
        inner.applied = 0;
        inner.fail_applies_after = count;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn next_stamp(current: Option<&Record>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_to_millis(now);
    match current {
        Some(current) if current.version_time() >= now => {
            current.version_time() + Duration::milliseconds(1)
        }
        _ => now,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn records_changed_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<Record>> {
        let inner = self.inner.lock().await;
        // BTreeMap order within one table is record_id order.
        Ok(inner
            .local_changes
            .iter()
            .filter(|(key, changed)| {
                key.table == table && since.map_or(true, |since| **changed > since)
            })
            .filter_map(|(key, _)| inner.records.get(key).cloned())
            .collect())
    }

    async fn get_record(&self, table: &str, record_id: &str) -> SyncResult<Option<Record>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(&RecordKey::new(table, record_id)).cloned())
    }

    async fn apply_record(&self, record: &Record) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;
        if let Some(limit) = inner.fail_applies_after {
            if inner.applied >= limit {
                return Err(SyncError::DatabaseError("simulated disk full".into()));
            }
        }

        let key = record.key();
        if let Some(current) = inner.records.get(&key) {
            if !supersedes(record, current) {
                return Ok(false);
            }
        }
        inner.local_changes.remove(&key);
        inner.records.insert(key, record.clone());
        inner.applied += 1;
        Ok(true)
    }
}

#[async_trait]
impl SyncStateStore for MemoryStore {
    async fn load_state(&self) -> SyncResult<SyncState> {
        Ok(self.inner.lock().await.state.clone())
    }

    async fn commit_round(&self, commit: &RoundCommit) -> SyncResult<()> {
        self.inner.lock().await.state.apply_commit(commit);
        Ok(())
    }

    async fn record_error(&self, error: &LastError) -> SyncResult<()> {
        self.inner.lock().await.state.last_error = Some(error.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn test_changed_since_is_strict_and_ordered() {
        let store = MemoryStore::with_device_id("dev-a");
        store.upsert_local("parts", "P-2", Fields::new(), t(200)).await;
        store.upsert_local("parts", "P-1", Fields::new(), t(100)).await;
        store.upsert_local("jobs", "J-1", Fields::new(), t(300)).await;

        let all = store.records_changed_since("parts", None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["P-1", "P-2"]);

        let after = store.records_changed_since("parts", Some(t(100))).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].record_id, "P-2");

        let tables = vec!["parts".to_string(), "jobs".to_string()];
        assert_eq!(store.count_changed_since(&tables, Some(t(150))).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_applied_versions_are_not_local_changes() {
        let store = MemoryStore::with_device_id("dev-a");
        store.upsert_local("parts", "P-1", Fields::new(), t(100)).await;
        store.upsert_local("parts", "P-2", Fields::new(), t(100)).await;

        let peer = Record::live("parts", "P-1", Fields::new(), t(900), "dev-b");
        assert!(store.apply_record(&peer).await.unwrap());

        let changed = store.records_changed_since("parts", Some(t(50))).await.unwrap();
        let ids: Vec<_> = changed.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["P-2"]);

        // A losing peer version leaves the local change alone.
        let stale = Record::live("parts", "P-2", Fields::new(), t(10), "dev-b");
        assert!(!store.apply_record(&stale).await.unwrap());
        assert_eq!(store.records_changed_since("parts", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_stamps_are_monotonic() {
        let store = MemoryStore::with_device_id("dev-a");
        let first = store.upsert_local("parts", "P-1", Fields::new(), t(500)).await;
        // Clock went backwards.
        let second = store.upsert_local("parts", "P-1", Fields::new(), t(400)).await;
        assert!(second.version_time() > first.version_time());

        let tomb = store.delete_local("parts", "P-1", t(400)).await.unwrap();
        assert!(tomb.version_time() > second.version_time());
        assert!(store.delete_local("parts", "P-404", t(400)).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_is_guarded_and_faultable() {
        let store = MemoryStore::with_device_id("dev-a");
        let newer = Record::live("parts", "P-1", Fields::new(), t(200), "dev-b");
        let older = Record::live("parts", "P-1", Fields::new(), t(100), "dev-c");

        assert!(store.apply_record(&newer).await.unwrap());
        assert!(!store.apply_record(&older).await.unwrap());
        assert!(!store.apply_record(&newer).await.unwrap());

        store.fail_applies_after(Some(0)).await;
        let next = Record::live("parts", "P-2", Fields::new(), t(300), "dev-b");
        assert!(store.apply_record(&next).await.is_err());
        store.fail_applies_after(None).await;
        assert!(store.apply_record(&next).await.unwrap());
    }
}
