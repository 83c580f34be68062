//! # Repository Module
//!
//! Database repository implementations for the sync engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories and their callers                       │
//! │                                                                         │
//! │  Change Log Reader ──► RecordRepository::records_changed_since         │
//! │  Merge (local side) ──► RecordRepository::get_record                   │
//! │  Apply/Commit ───────► RecordRepository::apply_record                  │
//! │                        SyncStateRepository::commit_round               │
//! │  Status Reporter ────► SyncStateRepository::load                       │
//! │                        RecordRepository::count_changed_since           │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`](records::RecordRepository) - record versions and tombstones
//! - [`SyncStateRepository`](sync_state::SyncStateRepository) - per-device sync state

pub mod records;
pub mod sync_state;
