//! # Record Repository
//!
//! Storage primitives the sync engine consumes: "read changed records since
//! T", "get record" and "apply record".
//!
//! ## Storage Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync_records                                                          │
//! │  ─────────────────────────────────────────────────────────────────────  │
//! │  (table_name, record_id)   PK                                          │
//! │  fields_json               NULL for tombstones                         │
//! │  updated_at_ms             epoch milliseconds                          │
//! │  deleted / deleted_at_ms   tombstone flag and time                     │
//! │  version_ms                deleted_at_ms if deleted, else updated_at   │
//! │  local_changed_ms          set by local writes, NULL once a peer       │
//! │                            version replaces the row                    │
//! │                                                                         │
//! │  records_changed_since(T):  local_changed_ms > T  ORDER BY record_id   │
//! │  apply_record(r):           BEGIN → read → supersedes? → upsert → COMMIT│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Monotonic Stamps
//! The change log reader is only correct if every local mutation is stamped
//! strictly after the previous version of the same record and after the
//! watermark of the round that published it. [`RecordRepository::upsert_local`]
//! and [`RecordRepository::delete_local`] enforce the first half by bumping a
//! stamp that would not move forward by one millisecond.
//!
//! Versions adopted from peers keep their own LWW time in `version_ms` but
//! are not local changes, however recent that time is.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::error::{DbError, DbResult};
use wiredpart_core::{from_millis, supersedes, truncate_to_millis, Fields, Record, RecordState};

/// Raw row of `sync_records`.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    table_name: String,
    record_id: String,
    fields_json: Option<String>,
    updated_at_ms: i64,
    origin_device: String,
    deleted: i64,
    deleted_at_ms: Option<i64>,
}

impl RecordRow {
    fn into_record(self) -> DbResult<Record> {
        let corrupt = |reason: &dyn std::fmt::Display| {
            DbError::corrupt(self.table_name.as_str(), self.record_id.as_str(), reason)
        };

        let updated_at = from_millis(self.updated_at_ms).map_err(|e| corrupt(&e))?;

        let state = if self.deleted != 0 {
            let ms = self
                .deleted_at_ms
                .ok_or_else(|| corrupt(&"tombstone without deleted_at_ms"))?;
            RecordState::Deleted {
                deleted_at: from_millis(ms).map_err(|e| corrupt(&e))?,
            }
        } else {
            let json = self
                .fields_json
                .as_deref()
                .ok_or_else(|| corrupt(&"live row without fields_json"))?;
            let fields: Fields = serde_json::from_str(json).map_err(|e| corrupt(&e))?;
            RecordState::Live { fields }
        };

        Ok(Record {
            table_name: self.table_name,
            record_id: self.record_id,
            state,
            updated_at,
            origin_device: self.origin_device,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT table_name, record_id, fields_json, updated_at_ms,
           origin_device, deleted, deleted_at_ms
    FROM sync_records
"#;

fn millis_or_min(since: Option<DateTime<Utc>>) -> i64 {
    since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN)
}

/// Repository for synchronized record versions.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    // =========================================================================
    // Change Log Reader
    // =========================================================================

    /// Returns every version of `table` written locally strictly after
    /// `since`, tombstones included, ordered by `record_id`. `None` returns
    /// every local change. Versions applied from peers are left out.
    pub async fn records_changed_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<Record>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE table_name = ?1 AND local_changed_ms > ?2 ORDER BY record_id ASC"
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(table)
            .bind(millis_or_min(since))
            .fetch_all(&self.pool)
            .await?;

        debug!(table = %table, count = rows.len(), "Read changed records");
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Counts local changes across `tables` made strictly after `since`.
    pub async fn count_changed_since(
        &self,
        tables: &[String],
        since: Option<DateTime<Utc>>,
    ) -> DbResult<u64> {
        let mut total = 0u64;
        for table in tables {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sync_records WHERE table_name = ?1 AND local_changed_ms > ?2",
            )
            .bind(table)
            .bind(millis_or_min(since))
            .fetch_one(&self.pool)
            .await?;
            total += count.max(0) as u64;
        }
        Ok(total)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Current version of one record, tombstone included.
    pub async fn get_record(&self, table: &str, record_id: &str) -> DbResult<Option<Record>> {
        let sql = format!("{SELECT_COLUMNS} WHERE table_name = ?1 AND record_id = ?2");
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(table)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RecordRow::into_record).transpose()
    }

    /// Number of live (non-deleted) records in `table`.
    pub async fn count_live(&self, table: &str) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_records WHERE table_name = ?1 AND deleted = 0",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Writes `record` only if it supersedes the stored version.
    ///
    /// ## Returns
    /// * `Ok(true)` - the record was written
    /// * `Ok(false)` - the stored version already wins (or is identical)
    ///
    /// Applying the same version twice is a no-op the second time, so a
    /// commit that failed halfway can simply be replayed.
    pub async fn apply_record(&self, record: &Record) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_in_tx(&mut tx, &record.table_name, &record.record_id).await?;
        if let Some(current) = &current {
            if !supersedes(record, current) {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        write_in_tx(&mut tx, record, None).await?;
        tx.commit().await?;

        debug!(
            table = %record.table_name,
            record_id = %record.record_id,
            deleted = record.is_deleted(),
            "Applied record version"
        );
        Ok(true)
    }

    // =========================================================================
    // Local Mutations
    // =========================================================================

    /// Records a local create or edit made by `device` at `now`.
    pub async fn upsert_local(
        &self,
        table: &str,
        record_id: &str,
        fields: Fields,
        device: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Record> {
        let mut tx = self.pool.begin().await?;
        let current = fetch_in_tx(&mut tx, table, record_id).await?;

        let stamp = next_stamp(current.as_ref(), now);
        let record = Record::live(table, record_id, fields, stamp, device);

        write_in_tx(&mut tx, &record, Some(stamp)).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Replaces a record with a tombstone stamped at `now`.
    ///
    /// Deleting an already-deleted record returns the existing tombstone.
    pub async fn delete_local(
        &self,
        table: &str,
        record_id: &str,
        device: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Record> {
        let mut tx = self.pool.begin().await?;
        let current = fetch_in_tx(&mut tx, table, record_id)
            .await?
            .ok_or_else(|| DbError::not_found(table, record_id))?;

        if current.is_deleted() {
            tx.rollback().await?;
            return Ok(current);
        }

        let stamp = next_stamp(Some(&current), now);
        let tombstone = Record::tombstone(table, record_id, stamp, device);

        write_in_tx(&mut tx, &tombstone, Some(stamp)).await?;
        tx.commit().await?;
        Ok(tombstone)
    }
}

/// A stamp at or after `now` and strictly after the current version.
fn next_stamp(current: Option<&Record>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_to_millis(now);
    match current {
        Some(current) if current.version_time() >= now => {
            current.version_time() + Duration::milliseconds(1)
        }
        _ => now,
    }
}

async fn fetch_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    record_id: &str,
) -> DbResult<Option<Record>> {
    let sql = format!("{SELECT_COLUMNS} WHERE table_name = ?1 AND record_id = ?2");
    let row: Option<RecordRow> = sqlx::query_as(&sql)
        .bind(table)
        .bind(record_id)
        .fetch_optional(&mut **tx)
        .await?;

    row.map(RecordRow::into_record).transpose()
}

/// Upserts `record`. `local_change` is the local write time, or `None` for
/// a version adopted from a peer.
async fn write_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record: &Record,
    local_change: Option<DateTime<Utc>>,
) -> DbResult<()> {
    let fields_json = match record.fields() {
        Some(fields) => Some(
            serde_json::to_string(fields)
                .map_err(|e| DbError::corrupt(&record.table_name, &record.record_id, e))?,
        ),
        None => None,
    };

    sqlx::query(
        r#"
        INSERT INTO sync_records (
            table_name, record_id, fields_json, updated_at_ms,
            origin_device, deleted, deleted_at_ms, version_ms,
            local_changed_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (table_name, record_id) DO UPDATE SET
            fields_json   = excluded.fields_json,
            updated_at_ms = excluded.updated_at_ms,
            origin_device = excluded.origin_device,
            deleted       = excluded.deleted,
            deleted_at_ms = excluded.deleted_at_ms,
            version_ms    = excluded.version_ms,
            local_changed_ms = excluded.local_changed_ms
        "#,
    )
    .bind(&record.table_name)
    .bind(&record.record_id)
    .bind(fields_json)
    .bind(record.updated_at.timestamp_millis())
    .bind(&record.origin_device)
    .bind(i64::from(record.is_deleted()))
    .bind(record.deleted_at().map(|t| t.timestamp_millis()))
    .bind(record.version_time().timestamp_millis())
    .bind(local_change.map(|t| t.timestamp_millis()))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
