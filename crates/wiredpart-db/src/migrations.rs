//! # Schema Migrations
//!
//! The files in `migrations/sqlite/` are compiled into the binary and
//! applied in name order on every open. sqlx records each one in
//! `_sqlx_migrations` with its checksum, so a file that has shipped must
//! never be edited: schema changes go in a new `NNN_*.sql`.
//!
//! | File                     | Adds                                        |
//! |--------------------------|---------------------------------------------|
//! | `001_sync_records.sql`   | record versions and tombstones              |
//! | `002_sync_state.sql`     | device id, watermark, peer cursors          |
//! | `003_local_changes.sql`  | local change stamp read by the change log   |

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies every migration the database has not seen yet.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    debug!(migrations = MIGRATOR.migrations.len(), "Schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_open_applies_every_migration_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'sync_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, vec!["sync_records", "sync_state"]);

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('sync_records')")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert!(columns.contains(&"local_changed_ms".to_string()));

        // A second run finds nothing to do.
        run_migrations(db.pool()).await.unwrap();
        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(applied as usize, MIGRATOR.migrations.len());
        assert_eq!(applied, 3);
    }
}
