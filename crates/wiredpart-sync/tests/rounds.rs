// Multi-device sync rounds over one in-memory shared folder.
//
// Every simulated device owns a MemoryStore and a SyncEngine; they only
// ever see each other through the folder.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use wiredpart_core::{ChangeSet, ErrorKind, Fields, Record, RecordKey};
use wiredpart_sync::lock::{LockToken, LOCK_FILE};
use wiredpart_sync::protocol::{change_set_path, encode_change_set};
use wiredpart_sync::{
    MemoryFolder, MemoryStore, SkipReason, SyncConfig, SyncEngine, SyncError, SyncFolder,
};

struct Device {
    id: &'static str,
    store: MemoryStore,
    engine: SyncEngine,
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::for_folder("/shared");
    config.sync.tables = vec!["parts".into(), "jobs".into()];
    config.lock.timeout_secs = 1;
    config.lock.initial_backoff_ms = 10;
    config.lock.max_backoff_ms = 50;
    config
}

fn device_with(folder: &MemoryFolder, id: &'static str, config: SyncConfig) -> Device {
    let store = MemoryStore::with_device_id(id);
    let engine = SyncEngine::new(
        config,
        Arc::new(folder.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    );
    Device { id, store, engine }
}

fn device(folder: &MemoryFolder, id: &'static str) -> Device {
    device_with(folder, id, config())
}

/// Fixed instant well in the past, so every local stamp predates any
/// round's watermark.
fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

fn name(value: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("name".into(), json!(value));
    fields
}

async fn get(device: &Device, table: &str, id: &str) -> Record {
    device
        .store
        .snapshot()
        .await
        .remove(&RecordKey::new(table, id))
        .unwrap_or_else(|| panic!("{} has no {table}/{id}", device.id))
}

async fn sync_all(devices: &[&Device]) {
    for device in devices {
        device.engine.sync().await.unwrap();
    }
}

// =============================================================================
// Last-write-wins across devices
// =============================================================================

#[tokio::test]
async fn test_later_edit_from_stale_device_wins() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");

    a.store.upsert_local("parts", "P-100", name("from A"), t(100)).await;
    // B never saw A's version and edits its own copy later.
    b.store.upsert_local("parts", "P-100", name("from B"), t(150)).await;

    a.engine.sync().await.unwrap();
    let report = b.engine.sync().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.records_written, 0);
    a.engine.sync().await.unwrap();

    for device in [&a, &b] {
        let record = get(device, "parts", "P-100").await;
        assert_eq!(record.fields(), Some(&name("from B")));
        assert_eq!(record.origin_device, "dev-b");
        assert_eq!(record.updated_at, t(150));
    }
    assert_eq!(b.store.state().await.last_round_conflicts, 1);
}

#[tokio::test]
async fn test_delete_beats_earlier_edit() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");

    a.store.upsert_local("parts", "P-200", name("original"), t(10)).await;
    a.store.delete_local("parts", "P-200", t(200)).await.unwrap();
    b.store.upsert_local("parts", "P-200", name("late edit"), t(195)).await;

    sync_all(&[&a, &b, &a]).await;

    for device in [&a, &b] {
        let record = get(device, "parts", "P-200").await;
        assert!(record.is_deleted(), "{} resurrected P-200", device.id);
        assert_eq!(record.deleted_at(), Some(t(200)));
    }
}

#[tokio::test]
async fn test_edit_after_delete_resurrects() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");

    a.store.upsert_local("parts", "P-300", name("original"), t(10)).await;
    a.store.delete_local("parts", "P-300", t(20)).await.unwrap();
    b.store.upsert_local("parts", "P-300", name("restocked"), t(30)).await;

    sync_all(&[&b, &a, &b]).await;

    for device in [&a, &b] {
        let record = get(device, "parts", "P-300").await;
        assert!(!record.is_deleted());
        assert_eq!(record.fields(), Some(&name("restocked")));
    }
}

#[tokio::test]
async fn test_edits_made_after_a_round_reach_peers() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");

    a.store.upsert_local("parts", "P-1", name("v1"), t(1)).await;
    sync_all(&[&a, &b]).await;
    assert_eq!(get(&b, "parts", "P-1").await.fields(), Some(&name("v1")));

    // Stamped after B's last round started.
    b.store.upsert_local("parts", "P-1", name("v2"), Utc::now()).await;
    let report = b.engine.sync().await.unwrap();
    assert_eq!(report.published.map(|p| p.records), Some(1));

    let report = a.engine.sync().await.unwrap();
    assert_eq!(report.records_written, 1);
    assert_eq!(get(&a, "parts", "P-1").await.fields(), Some(&name("v2")));
}

// =============================================================================
// Convergence
// =============================================================================

/// Three devices with overlapping edits, synced in `order` twice over.
async fn converge(order: [usize; 3]) -> Vec<BTreeMap<RecordKey, Record>> {
    let folder = MemoryFolder::new();
    let devices = [
        device(&folder, "dev-a"),
        device(&folder, "dev-b"),
        device(&folder, "dev-c"),
    ];
    let [a, b, c] = &devices;

    a.store.upsert_local("parts", "P-1", name("a1"), t(10)).await;
    b.store.upsert_local("parts", "P-1", name("b1"), t(20)).await;
    c.store.upsert_local("parts", "P-1", name("c1"), t(15)).await;

    // Exact tie: the greatest origin device wins.
    a.store.upsert_local("parts", "P-2", name("a2"), t(50)).await;
    c.store.upsert_local("parts", "P-2", name("c2"), t(50)).await;

    b.store.upsert_local("parts", "P-3", name("b3"), t(5)).await;
    b.store.delete_local("parts", "P-3", t(40)).await.unwrap();
    a.store.upsert_local("parts", "P-3", name("a3"), t(30)).await;

    c.store.upsert_local("jobs", "J-1", name("job"), t(60)).await;

    for _ in 0..2 {
        for index in order {
            devices[index].engine.sync().await.unwrap();
        }
    }

    let mut snapshots = Vec::new();
    for device in &devices {
        snapshots.push(device.store.snapshot().await);
    }
    snapshots
}

#[tokio::test]
async fn test_devices_converge_regardless_of_round_order() {
    let forward = converge([0, 1, 2]).await;
    let rotated = converge([2, 0, 1]).await;

    assert_eq!(forward[0], forward[1]);
    assert_eq!(forward[1], forward[2]);
    assert_eq!(forward[0], rotated[0]);

    let final_state = &forward[0];
    assert_eq!(final_state.len(), 4);
    let p1 = &final_state[&RecordKey::new("parts", "P-1")];
    assert_eq!(p1.fields(), Some(&name("b1")));
    let p2 = &final_state[&RecordKey::new("parts", "P-2")];
    assert_eq!(p2.origin_device, "dev-c");
    assert!(final_state[&RecordKey::new("parts", "P-3")].is_deleted());
    assert!(final_state.contains_key(&RecordKey::new("jobs", "J-1")));
}

#[tokio::test]
async fn test_repeated_rounds_change_nothing() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");

    a.store.upsert_local("parts", "P-1", name("a"), t(10)).await;
    b.store.upsert_local("parts", "P-2", name("b"), t(20)).await;
    sync_all(&[&a, &b, &a]).await;

    let before_a = a.store.snapshot().await;
    let before_b = b.store.snapshot().await;
    let files_before = folder.paths().await.len();

    for device in [&a, &b, &a, &b] {
        let report = device.engine.sync().await.unwrap();
        assert!(report.published.is_none());
        assert_eq!(report.change_sets_read, 0);
        assert_eq!(report.records_written, 0);
    }

    assert_eq!(a.store.snapshot().await, before_a);
    assert_eq!(b.store.snapshot().await, before_b);
    assert_eq!(folder.paths().await.len(), files_before);
}

// =============================================================================
// Lock coordination
// =============================================================================

#[tokio::test]
async fn test_round_reclaims_abandoned_lock() {
    let folder = MemoryFolder::new();
    let c = device(&folder, "dev-c");
    c.store.upsert_local("parts", "P-1", name("c"), t(1)).await;

    // Left behind by a device that crashed ten minutes ago; threshold is five.
    let abandoned = LockToken::new("dev-crashed", Utc::now() - Duration::minutes(10));
    folder
        .put_raw(LOCK_FILE, serde_json::to_vec(&abandoned).unwrap())
        .await;

    let report = c.engine.sync().await.unwrap();
    assert_eq!(report.published.map(|p| p.sequence), Some(1));
    assert!(!folder.paths().await.iter().any(|p| p == LOCK_FILE));
}

#[tokio::test(start_paused = true)]
async fn test_live_lock_defers_round_without_changes() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    a.store.upsert_local("parts", "P-1", name("a"), t(1)).await;

    let held = LockToken::new("dev-b", Utc::now());
    folder.put_raw(LOCK_FILE, serde_json::to_vec(&held).unwrap()).await;

    let err = a.engine.sync().await.unwrap_err();
    match &err {
        SyncError::LockBusy { holder, .. } => assert_eq!(holder, "dev-b"),
        other => panic!("expected LockBusy, got {other:?}"),
    }
    assert!(err.is_deferred());

    let state = a.store.state().await;
    assert!(state.watermark.is_none());
    assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::Deferred));
    assert!(!folder.paths().await.iter().any(|p| p.starts_with("changes/")));

    // The holder's token is untouched.
    assert!(folder.read(LOCK_FILE).await.unwrap().is_some());
}

// =============================================================================
// Failure safety
// =============================================================================

#[tokio::test]
async fn test_offline_round_loses_nothing() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");
    a.store.upsert_local("parts", "P-1", name("a"), t(1)).await;

    folder.set_online(false);
    let err = a.engine.sync().await.unwrap_err();
    assert!(err.is_offline());
    let state = a.store.state().await;
    assert!(state.watermark.is_none());
    assert!(state.peer_cursors.is_empty());
    assert_eq!(a.engine.health().await.unwrap().pending_local_changes, 1);

    folder.set_online(true);
    sync_all(&[&a, &b]).await;
    assert_eq!(get(&b, "parts", "P-1").await.fields(), Some(&name("a")));
    assert!(a.store.state().await.last_error.is_none());
}

#[tokio::test]
async fn test_commit_failure_is_replayed_next_round() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");
    for (i, id) in ["P-1", "P-2", "P-3"].into_iter().enumerate() {
        a.store.upsert_local("parts", id, name(id), t(i as i64)).await;
    }
    a.engine.sync().await.unwrap();

    b.store.fail_applies_after(Some(1)).await;
    let err = b.engine.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::CommitFailure { applied: 1, .. }));

    let state = b.store.state().await;
    assert!(state.watermark.is_none());
    assert_eq!(state.cursor_for("dev-a"), 0);
    assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::Commit));

    b.store.fail_applies_after(None).await;
    let report = b.engine.sync().await.unwrap();
    assert_eq!(report.change_sets_read, 1);
    assert_eq!(report.records_written, 2);
    assert_eq!(b.store.snapshot().await, a.store.snapshot().await);
    assert_eq!(b.store.state().await.cursor_for("dev-a"), 1);
}

#[tokio::test]
async fn test_unreadable_change_sets_are_skipped() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");
    a.store.upsert_local("parts", "P-1", name("a"), t(1)).await;
    a.engine.sync().await.unwrap();

    folder
        .put_raw(&change_set_path("dev-c", 1), "{\"protocol_version\": 1, \"device_")
        .await;
    let mut future = ChangeSet::new("dev-d", 1, t(5));
    future.protocol_version = 99;
    folder
        .put_raw(&change_set_path("dev-d", 1), serde_json::to_vec(&future).unwrap())
        .await;

    let report = b.engine.sync().await.unwrap();
    assert_eq!(report.records_written, 1);
    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .any(|s| s.device_id == "dev-c" && matches!(s.reason, SkipReason::Malformed(_))));
    assert!(report.skipped.iter().any(|s| s.device_id == "dev-d"
        && matches!(s.reason, SkipReason::IncompatibleVersion { found: 99, .. })));

    let state = b.store.state().await;
    assert_eq!(state.cursor_for("dev-a"), 1);
    assert_eq!(state.cursor_for("dev-c"), 0);
    assert_eq!(state.cursor_for("dev-d"), 0);

    // Once the partial upload completes, the next round picks it up.
    let mut finished = ChangeSet::new("dev-c", 1, t(6));
    finished.push_table("parts", vec![Record::live("parts", "P-9", name("c"), t(6), "dev-c")]);
    folder
        .put_raw(&change_set_path("dev-c", 1), encode_change_set(&finished).unwrap())
        .await;
    let report = b.engine.sync().await.unwrap();
    assert_eq!(report.records_written, 1);
    assert_eq!(b.store.state().await.cursor_for("dev-c"), 1);
}

#[tokio::test]
async fn test_change_sets_arriving_out_of_order_are_merged() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");

    let change_set = |seq: u64, id: &str| {
        let mut cs = ChangeSet::new("dev-b", seq, t(seq as i64));
        cs.push_table("parts", vec![Record::live("parts", id, name(id), t(seq as i64), "dev-b")]);
        encode_change_set(&cs).unwrap()
    };

    // The folder's own sync delivers seq 2 before seq 1.
    folder.put_raw(&change_set_path("dev-b", 2), change_set(2, "P-2")).await;
    let report = a.engine.sync().await.unwrap();
    assert_eq!(report.records_written, 1);
    assert_eq!(a.store.state().await.cursor_for("dev-b"), 0);

    folder.put_raw(&change_set_path("dev-b", 1), change_set(1, "P-1")).await;
    a.engine.sync().await.unwrap();
    assert_eq!(get(&a, "parts", "P-1").await.fields(), Some(&name("P-1")));
    assert_eq!(get(&a, "parts", "P-2").await.fields(), Some(&name("P-2")));
    assert_eq!(a.store.state().await.cursor_for("dev-b"), 2);
}

// =============================================================================
// Modes and garbage collection
// =============================================================================

#[tokio::test]
async fn test_publish_only_and_pull_only_rounds() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");
    a.store.upsert_local("parts", "P-1", name("a"), t(1)).await;
    b.store.upsert_local("parts", "P-2", name("b"), t(2)).await;

    let report = a.engine.publish_only().await.unwrap();
    assert!(report.published.is_some());
    let report = b.engine.publish_only().await.unwrap();
    assert_eq!(report.change_sets_read, 0);
    assert!(b.store.snapshot().await.get(&RecordKey::new("parts", "P-1")).is_none());

    let report = b.engine.pull_only().await.unwrap();
    assert!(report.published.is_none());
    assert_eq!(report.records_written, 1);
    assert_eq!(b.store.snapshot().await.len(), 2);
}

#[tokio::test]
async fn test_pulled_versions_are_not_pending_local_changes() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");
    a.store.upsert_local("parts", "P-1", name("v1"), t(1)).await;
    sync_all(&[&a, &b]).await;

    // B's edit is stamped after A's watermark.
    b.store.upsert_local("parts", "P-1", name("v2"), Utc::now()).await;
    b.engine.sync().await.unwrap();

    let report = a.engine.pull_only().await.unwrap();
    assert_eq!(report.records_written, 1);
    assert_eq!(a.engine.health().await.unwrap().pending_local_changes, 0);

    // A has nothing of its own to publish.
    let report = a.engine.sync().await.unwrap();
    assert!(report.published.is_none());
    assert_eq!(get(&a, "parts", "P-1").await.origin_device, "dev-b");
}

#[tokio::test]
async fn test_acknowledged_change_sets_are_pruned() {
    let folder = MemoryFolder::new();
    let mut gc_config = config();
    gc_config.retention.min_age_hours = 0;
    let a = device_with(&folder, "dev-a", gc_config.clone());
    let b = device_with(&folder, "dev-b", gc_config);

    a.store.upsert_local("parts", "P-1", name("a"), t(1)).await;
    let report = a.engine.sync().await.unwrap();
    assert_eq!(report.gc_deleted, 0);

    // B incorporates A's first Change Set and says so.
    b.engine.sync().await.unwrap();
    assert!(folder.paths().await.contains(&"acks/dev-b.json".to_string()));

    let report = a.engine.sync().await.unwrap();
    assert_eq!(report.gc_deleted, 1);
    assert!(folder.read(&change_set_path("dev-a", 1)).await.unwrap().is_none());

    // The record itself survives everywhere.
    assert!(!get(&b, "parts", "P-1").await.is_deleted());

    // A device joining later is not held up by the pruned sequence.
    let c = device_with(&folder, "dev-c", config());
    a.store.upsert_local("parts", "P-2", name("a2"), Utc::now()).await;
    a.engine.sync().await.unwrap();
    let report = c.engine.sync().await.unwrap();
    assert_eq!(report.change_sets_read, 1);
    assert_eq!(c.store.state().await.cursor_for("dev-a"), 2);
}

#[tokio::test]
async fn test_peers_lists_every_publishing_device() {
    let folder = MemoryFolder::new();
    let a = device(&folder, "dev-a");
    let b = device(&folder, "dev-b");
    a.store.upsert_local("parts", "P-1", name("a"), t(1)).await;
    b.store.upsert_local("parts", "P-2", name("b"), t(2)).await;
    sync_all(&[&a, &b]).await;

    let peers = a.engine.peers().await.unwrap();
    let ids: Vec<_> = peers.iter().map(|p| p.device_id.as_str()).collect();
    assert_eq!(ids, vec!["dev-a", "dev-b"]);
    assert!(peers.iter().all(|p| p.latest_sequence == 1 && p.file_count == 1));
}
