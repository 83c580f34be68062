//! # Merge Engine
//!
//! Last-write-wins reconciliation of record versions coming from the local
//! store and from every Change Set read in a sync round.
//!
//! ## Resolution Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Version Ordering (highest wins)                       │
//! │                                                                         │
//! │  1. version_time      deleted_at for tombstones, updated_at otherwise  │
//! │                       (both on the same axis)                          │
//! │  2. origin_device     lexicographically greatest wins exact ties       │
//! │  3. tombstone > live  same device, same millisecond                    │
//! │  4. canonical fields  JSON of the payload, so distinct versions        │
//! │     + updated_at      never compare equal                              │
//! │                                                                         │
//! │  Example: part P-200                                                   │
//! │    dev-a  Deleted  @200  ─┐                                            │
//! │    dev-b  Live     @195  ─┼──► winner: dev-a tombstone @200            │
//! │    local  Live     @150  ─┘                                            │
//! │    later: dev-b Live @250 ──► winner: resurrected by dev-b             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Because the order is total, taking the maximum over a set of candidates
//! is commutative, associative and idempotent: feeding Change Sets in any
//! order, or the same Change Set twice, yields the same winners.
//!
//! ## Conflicts
//! A record counts as conflicted when versions contributed by the round's
//! Change Sets (the local device's own delta included) come from more than
//! one `origin_device`. Conflicts are reported only; they never change the
//! winner.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Record, RecordKey, RecordState};
use crate::ChangeSet;

/// The local store's current version of every record the round touches.
pub type LocalState = BTreeMap<RecordKey, Record>;

// =============================================================================
// Version Ordering
// =============================================================================

/// Total order over two versions of the same record.
///
/// `Ordering::Greater` means `a` wins over `b`.
pub fn compare_versions(a: &Record, b: &Record) -> Ordering {
    a.version_time()
        .cmp(&b.version_time())
        .then_with(|| a.origin_device.cmp(&b.origin_device))
        .then_with(|| a.is_deleted().cmp(&b.is_deleted()))
        .then_with(|| canonical_payload(a).cmp(&canonical_payload(b)))
        .then_with(|| a.updated_at.cmp(&b.updated_at))
}

/// Returns true if `candidate` strictly beats `current`.
pub fn supersedes(candidate: &Record, current: &Record) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

fn canonical_payload(record: &Record) -> String {
    match &record.state {
        // Fields is a BTreeMap and serde_json maps are sorted, so this
        // encoding is stable across devices.
        RecordState::Live { fields } => serde_json::to_string(fields).unwrap_or_default(),
        RecordState::Deleted { .. } => String::new(),
    }
}

// =============================================================================
// Merge Outcome
// =============================================================================

/// Result of merging one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Winning version of every record that appeared locally or in a
    /// Change Set.
    pub merged: BTreeMap<RecordKey, Record>,

    /// Winners that differ from the local state, ordered by key. These are
    /// the only writes the commit stage performs.
    pub changes: Vec<Record>,

    /// Records offered by Change Sets from more than one device. The own
    /// delta counts; the stored local version alone does not.
    pub conflicts: BTreeSet<RecordKey>,

    /// Number of `changes` that did not exist locally before.
    pub adopted: usize,
}

impl MergeOutcome {
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Number of records to write, per table.
    pub fn changes_by_table(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.changes {
            *counts.entry(record.table_name.clone()).or_insert(0) += 1;
        }
        counts
    }
}

// =============================================================================
// Merger
// =============================================================================

#[derive(Debug, Default)]
struct Candidates {
    local: Option<Record>,
    winner: Option<Record>,
    contributed_by: BTreeSet<String>,
}

/// Incremental merge accumulator.
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use wiredpart_core::{ChangeSet, Fields, Merger, Record};
///
/// let t = |ms| Utc.timestamp_millis_opt(ms).unwrap();
/// let mut a = ChangeSet::new("dev-a", 1, t(300));
/// a.push_table("parts", vec![Record::tombstone("parts", "P-200", t(200), "dev-a")]);
/// let mut b = ChangeSet::new("dev-b", 1, t(300));
/// b.push_table("parts", vec![Record::live("parts", "P-200", Fields::new(), t(195), "dev-b")]);
///
/// let mut merger = Merger::new();
/// merger.add_change_set(&b);
/// merger.add_change_set(&a);
/// let outcome = merger.finish();
///
/// assert!(outcome.changes[0].is_deleted());
/// assert_eq!(outcome.conflict_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Merger {
    records: BTreeMap<RecordKey, Candidates>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the merger with the local store's current versions.
    ///
    /// Seeded versions compete for the winner but never make a record a
    /// conflict; offer this device's own delta as a Change Set for that.
    pub fn with_local_state(local: LocalState) -> Self {
        let mut merger = Merger::new();
        for (key, record) in local {
            let entry = merger.records.entry(key).or_default();
            entry.winner = Some(record.clone());
            entry.local = Some(record);
        }
        merger
    }

    /// Offers one version contributed by a Change Set.
    pub fn add_version(&mut self, record: &Record) {
        let entry = self.records.entry(record.key()).or_default();
        entry.contributed_by.insert(record.origin_device.clone());

        let replace = match &entry.winner {
            Some(current) => supersedes(record, current),
            None => true,
        };
        if replace {
            entry.winner = Some(record.clone());
        }
    }

    /// Offers every version in a Change Set.
    pub fn add_change_set(&mut self, change_set: &ChangeSet) {
        for record in change_set.records() {
            self.add_version(record);
        }
    }

    /// Resolves winners, the write list and the conflict set.
    pub fn finish(self) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for (key, candidates) in self.records {
            let Some(winner) = candidates.winner else {
                continue;
            };

            if candidates.contributed_by.len() > 1 {
                outcome.conflicts.insert(key.clone());
            }

            match &candidates.local {
                Some(local) if *local == winner => {}
                Some(_) => outcome.changes.push(winner.clone()),
                None => {
                    outcome.adopted += 1;
                    outcome.changes.push(winner.clone());
                }
            }

            outcome.merged.insert(key, winner);
        }

        outcome
    }
}

/// Merges the local state with every Change Set of the round.
///
/// The result does not depend on the order of `change_sets`.
pub fn merge(local: LocalState, change_sets: &[ChangeSet]) -> MergeOutcome {
    let mut merger = Merger::with_local_state(local);
    for change_set in change_sets {
        merger.add_change_set(change_set);
    }
    merger.finish()
}
