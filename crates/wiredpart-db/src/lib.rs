//! # wiredpart-db: Local Record Store for WiredPart
//!
//! This crate is the storage collaborator of the sync engine: the local copy
//! of every synchronized table plus the device's durable sync state.
//! It uses SQLite for local storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WiredPart Data Flow                              │
//! │                                                                         │
//! │  Sync round (wiredpart-sync)                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   wiredpart-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌─────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories   │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                 │   │  (embedded)  │  │   │
//! │  │   │               │    │ RecordRepository│   │ 001_records  │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncStateRepo   │   │ 002_state    │  │   │
//! │  │   │               │    │                 │   │ 003_local    │  │   │
//! │  │   └───────────────┘    └─────────────────┘   └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │        <platform data dir>/com.wiredpart.wiredpart/wiredpart.db │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Opening the store and handing out repositories
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Record and sync-state repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wiredpart_db::{Database, DbConfig};
//!
//! // Opens (or creates) the file and applies pending migrations
//! let config = DbConfig::new("path/to/wiredpart.db");
//! let db = Database::new(config).await?;
//!
//! // Use repositories
//! let state = db.sync_state().load().await?;
//! let pending = db.records().records_changed_since("parts", state.watermark).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::records::RecordRepository;
pub use repository::sync_state::SyncStateRepository;
