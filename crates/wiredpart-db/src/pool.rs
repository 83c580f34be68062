//! # Database Handle
//!
//! Opens the local record store and hands out repositories.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DbConfig::new(path)        file store: WAL, up to 4 connections       │
//! │  DbConfig::in_memory()      tests: ONE connection, never recycled,     │
//! │                             since the database dies with it            │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  Database::new(config)  →  open pool  →  apply migrations/sqlite/*     │
//! │          │                                                              │
//! │          ├── records()     RecordRepository    (change log, apply)     │
//! │          └── sync_state()  SyncStateRepository (device id, watermark)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The app's own edits and the sync agent share one pool. A round commit
//! holds a connection only for one record's transaction at a time, so a
//! running round never starves the UI of connections.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::records::RecordRepository;
use crate::repository::sync_state::SyncStateRepository;

/// Connections for a file-backed store.
const FILE_POOL_SIZE: u32 = 4;

/// How long a caller waits for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the record store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbConfig {
    /// SQLite file, created on first open.
    File(PathBuf),
    /// Private in-memory store, gone when the handle is dropped.
    InMemory,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig::File(path.into())
    }

    pub fn in_memory() -> Self {
        DbConfig::InMemory
    }

    fn pool_size(&self) -> u32 {
        match self {
            DbConfig::File(_) => FILE_POOL_SIZE,
            DbConfig::InMemory => 1,
        }
    }
}

/// Open record store. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the store described by `config` and brings its schema up to
    /// date.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let options = match &config {
            DbConfig::File(path) => {
                info!(path = %path.display(), "Opening record store");
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
            }
            DbConfig::InMemory => {
                info!("Opening in-memory record store");
                SqliteConnectOptions::new().in_memory(true)
            }
        };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.pool_size())
            .acquire_timeout(ACQUIRE_TIMEOUT);
        if config == DbConfig::InMemory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        migrations::run_migrations(&pool).await?;
        Ok(Database { pool })
    }

    /// Raw pool, for queries the repositories do not cover.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }

    pub fn sync_state(&self) -> SyncStateRepository {
        SyncStateRepository::new(self.pool.clone())
    }

    /// Waits for in-flight queries, then closes every connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Record store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_keeps_its_data() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let id = db.sync_state().device_id().await.unwrap();

        // Same single connection, same database.
        assert_eq!(db.clone().sync_state().device_id().await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wiredpart.db");

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let id = db.sync_state().device_id().await.unwrap();
        db.close().await;

        let reopened = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(reopened.sync_state().device_id().await.unwrap(), id);

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
