//! # Sync State Repository
//!
//! Persists the per-device [`SyncState`]: stable device identity, the
//! watermark, last round results and per-peer cursors.
//!
//! ## Keys
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync_state (key → value)                                              │
//! │                                                                         │
//! │  device_id               uuid v4, written once on first run            │
//! │  watermark_ms            1ms before the last committed round started   │
//! │  last_sync_at_ms         end time of the last committed round          │
//! │  last_round_conflicts    integer                                       │
//! │  published_sequence      highest committed Change Set sequence         │
//! │  peer_cursor:<device>    highest peer sequence incorporated            │
//! │  last_error              JSON LastError, cleared by a commit           │
//! │                                                                         │
//! │  commit_round() writes all round keys in ONE transaction, so the       │
//! │  watermark never moves without the cursors that go with it.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use wiredpart_core::{from_millis, LastError, RoundCommit, SyncState};

const KEY_DEVICE_ID: &str = "device_id";
const KEY_WATERMARK: &str = "watermark_ms";
const KEY_LAST_SYNC: &str = "last_sync_at_ms";
const KEY_CONFLICTS: &str = "last_round_conflicts";
const KEY_PUBLISHED: &str = "published_sequence";
const KEY_LAST_ERROR: &str = "last_error";
const PEER_CURSOR_PREFIX: &str = "peer_cursor:";

/// Repository for per-device sync state.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    /// Creates a new SyncStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    /// Reads one raw value.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT state_value FROM sync_state WHERE state_key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    /// Returns this device's id, generating and persisting one on first use.
    pub async fn device_id(&self) -> DbResult<String> {
        if let Some(id) = self.get(KEY_DEVICE_ID).await? {
            return Ok(id);
        }

        let generated = Uuid::new_v4().to_string();
        // INSERT OR IGNORE: a concurrent first call keeps whichever id won.
        sqlx::query(
            "INSERT OR IGNORE INTO sync_state (state_key, state_value, updated_at_ms) VALUES (?1, ?2, ?3)",
        )
        .bind(KEY_DEVICE_ID)
        .bind(&generated)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let id = self
            .get(KEY_DEVICE_ID)
            .await?
            .ok_or_else(|| DbError::not_found("sync_state", KEY_DEVICE_ID))?;
        info!(device_id = %id, "Initialized device identity");
        Ok(id)
    }

    /// Loads the full sync state.
    pub async fn load(&self) -> DbResult<SyncState> {
        let device_id = self.device_id().await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT state_key, state_value FROM sync_state")
                .fetch_all(&self.pool)
                .await?;

        let mut state = SyncState::new(device_id);
        for (key, value) in rows {
            match key.as_str() {
                KEY_WATERMARK => state.watermark = Some(parse_time(&key, &value)?),
                KEY_LAST_SYNC => state.last_sync_at = Some(parse_time(&key, &value)?),
                KEY_CONFLICTS => state.last_round_conflicts = parse_u64(&key, &value)?,
                KEY_PUBLISHED => state.published_sequence = parse_u64(&key, &value)?,
                KEY_LAST_ERROR => {
                    let err: LastError = serde_json::from_str(&value)
                        .map_err(|e| DbError::corrupt("sync_state", key.as_str(), e))?;
                    state.last_error = Some(err);
                }
                other => {
                    if let Some(peer) = other.strip_prefix(PEER_CURSOR_PREFIX) {
                        let seq = parse_u64(&key, &value)?;
                        state.peer_cursors.insert(peer.to_string(), seq);
                    }
                }
            }
        }

        Ok(state)
    }

    /// Persists a successful round atomically and clears the last error.
    ///
    /// Sequences and cursors never move backwards.
    pub async fn commit_round(&self, commit: &RoundCommit) -> DbResult<()> {
        let current = self.load().await?;
        let mut next = current.clone();
        next.apply_commit(commit);

        let mut tx = self.pool.begin().await?;

        if let Some(watermark) = commit.watermark {
            put_in_tx(&mut tx, KEY_WATERMARK, &watermark.timestamp_millis().to_string()).await?;
        }
        put_in_tx(&mut tx, KEY_LAST_SYNC, &commit.completed_at.timestamp_millis().to_string()).await?;
        put_in_tx(&mut tx, KEY_CONFLICTS, &commit.conflicts.to_string()).await?;
        put_in_tx(&mut tx, KEY_PUBLISHED, &next.published_sequence.to_string()).await?;
        for (peer, seq) in &next.peer_cursors {
            if current.peer_cursors.get(peer) != Some(seq) {
                put_in_tx(&mut tx, &format!("{PEER_CURSOR_PREFIX}{peer}"), &seq.to_string()).await?;
            }
        }
        sqlx::query("DELETE FROM sync_state WHERE state_key = ?1")
            .bind(KEY_LAST_ERROR)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            watermark = ?commit.watermark,
            conflicts = commit.conflicts,
            "Committed sync state"
        );
        Ok(())
    }

    /// Records the failure of a round. Leaves the watermark untouched.
    pub async fn record_error(&self, error: &LastError) -> DbResult<()> {
        let json = serde_json::to_string(error)
            .map_err(|e| DbError::corrupt("sync_state", KEY_LAST_ERROR, e))?;
        let mut tx = self.pool.begin().await?;
        put_in_tx(&mut tx, KEY_LAST_ERROR, &json).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn put_in_tx(tx: &mut Transaction<'_, Sqlite>, key: &str, value: &str) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (state_key, state_value, updated_at_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (state_key) DO UPDATE SET
            state_value   = excluded.state_value,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().timestamp_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_u64(key: &str, value: &str) -> DbResult<u64> {
    value
        .parse()
        .map_err(|e| DbError::corrupt("sync_state", key, e))
}

fn parse_time(key: &str, value: &str) -> DbResult<chrono::DateTime<Utc>> {
    let ms: i64 = value
        .parse()
        .map_err(|e| DbError::corrupt("sync_state", key, e))?;
    from_millis(ms).map_err(|e| DbError::corrupt("sync_state", key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::{DateTime, TimeZone};
    use std::collections::BTreeMap;
    use wiredpart_core::ErrorKind;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    async fn repo() -> SyncStateRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().sync_state()
    }

    #[tokio::test]
    async fn test_device_id_is_stable() {
        let repo = repo().await;
        let first = repo.device_id().await.unwrap();
        let second = repo.device_id().await.unwrap();
        assert_eq!(first, second);
        assert!(wiredpart_core::validation::validate_device_id(&first).is_ok());
    }

    #[tokio::test]
    async fn test_fresh_state() {
        let state = repo().await.load().await.unwrap();
        assert!(state.watermark.is_none());
        assert!(state.last_sync_at.is_none());
        assert_eq!(state.published_sequence, 0);
        assert!(state.peer_cursors.is_empty());
    }

    #[tokio::test]
    async fn test_commit_round_round_trips() {
        let repo = repo().await;
        repo.record_error(&LastError {
            kind: ErrorKind::Offline,
            message: "folder unreachable".into(),
            occurred_at: t(50),
        })
        .await
        .unwrap();
        assert!(repo.load().await.unwrap().last_error.is_some());

        let mut cursors = BTreeMap::new();
        cursors.insert("dev-b".to_string(), 3);
        repo.commit_round(&RoundCommit {
            watermark: Some(t(100)),
            completed_at: t(120),
            conflicts: 2,
            published_sequence: Some(7),
            peer_cursors: cursors,
        })
        .await
        .unwrap();

        let state = repo.load().await.unwrap();
        assert_eq!(state.watermark, Some(t(100)));
        assert_eq!(state.last_sync_at, Some(t(120)));
        assert_eq!(state.last_round_conflicts, 2);
        assert_eq!(state.published_sequence, 7);
        assert_eq!(state.cursor_for("dev-b"), 3);
        assert!(state.last_error.is_none());

        // A later round with a lower cursor does not move it back.
        let mut cursors = BTreeMap::new();
        cursors.insert("dev-b".to_string(), 1);
        repo.commit_round(&RoundCommit {
            watermark: Some(t(200)),
            completed_at: t(210),
            conflicts: 0,
            published_sequence: None,
            peer_cursors: cursors,
        })
        .await
        .unwrap();

        let state = repo.load().await.unwrap();
        assert_eq!(state.cursor_for("dev-b"), 3);
        assert_eq!(state.published_sequence, 7);
        assert_eq!(state.watermark, Some(t(200)));
    }
}
