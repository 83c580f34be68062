//! # Apply/Commit Stage
//!
//! Writes a round's merge winners to the local store, then persists the
//! round in one state commit.
//!
//! ## Failure Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  apply winner 1 ✓  apply winner 2 ✓  apply winner 3 ✗                 │
//! │                                                                         │
//! │  → CommitFailure { applied: 2 }                                        │
//! │  → state commit NOT attempted: watermark and cursors unchanged         │
//! │  → next round recomputes the same delta; winners 1 and 2 re-apply as   │
//! │    no-ops (apply_record is guarded by the LWW order)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use wiredpart_core::{MergeOutcome, RoundCommit};

use crate::error::{SyncError, SyncResult};
use crate::store::{RecordStore, SyncStateStore};

/// What a successful commit wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Table → records actually written.
    pub written_by_table: BTreeMap<String, usize>,
    pub records_written: usize,
}

/// Applies merge results and advances durable state.
pub struct CommitStage {
    records: Arc<dyn RecordStore>,
    state: Arc<dyn SyncStateStore>,
}

impl CommitStage {
    pub fn new(records: Arc<dyn RecordStore>, state: Arc<dyn SyncStateStore>) -> Self {
        CommitStage { records, state }
    }

    /// Writes every winner that differs from local state, then commits
    /// `round`. The watermark moves only if every write succeeded.
    pub async fn commit(&self, outcome: &MergeOutcome, round: &RoundCommit) -> SyncResult<CommitSummary> {
        let mut summary = CommitSummary::default();
        let mut applied = 0usize;

        for record in &outcome.changes {
            match self.records.apply_record(record).await {
                Ok(written) => {
                    applied += 1;
                    if written {
                        summary.records_written += 1;
                        *summary
                            .written_by_table
                            .entry(record.table_name.clone())
                            .or_insert(0) += 1;
                    }
                    debug!(
                        key = %record.key(),
                        origin = %record.origin_device,
                        deleted = record.is_deleted(),
                        written,
                        "Applied merge winner"
                    );
                }
                Err(e) => {
                    warn!(
                        key = %record.key(),
                        applied,
                        error = %e,
                        "Commit failed; watermark not advanced"
                    );
                    return Err(SyncError::CommitFailure {
                        applied,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.state.commit_round(round).await.map_err(|e| {
            warn!(applied, error = %e, "State commit failed; watermark not advanced");
            SyncError::CommitFailure {
                applied,
                reason: e.to_string(),
            }
        })?;

        info!(
            records_written = summary.records_written,
            conflicts = round.conflicts,
            "Committed sync round"
        );
        Ok(summary)
    }
}
