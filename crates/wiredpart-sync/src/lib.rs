//! # wiredpart-sync: Folder Sync Engine for WiredPart
//!
//! This crate keeps independent, intermittently connected WiredPart devices
//! in agreement through a shared, unreliable folder (a cloud-synced
//! directory or network share). There is no server: every device publishes
//! immutable Change Sets and merges everyone else's with last-write-wins.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (Scheduler)                       │  │
//! │  │                                                                  │  │
//! │  │  Interval timer + manual trigger, one round at a time            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncEngine (one round)                      │  │
//! │  └──┬──────────────┬──────────────┬──────────────┬──────────────┬──┘  │
//! │     ▼              ▼              ▼              ▼              ▼      │
//! │  ┌────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌────────┐  │
//! │  │ Lock   │  │ Outbox    │  │ Peer      │  │ Merger    │  │ Commit │  │
//! │  │ Coord. │  │ (publish) │  │ Collector │  │ (core)    │  │ Stage  │  │
//! │  └───┬────┘  └─────┬─────┘  └─────┬─────┘  └───────────┘  └───┬────┘  │
//! │      │             │              │                            │       │
//! │      ▼             ▼              ▼                            ▼       │
//! │  ┌──────────────────────────────────────┐   ┌──────────────────────┐  │
//! │  │ SyncFolder (FsFolder / MemoryFolder) │   │ RecordStore /        │  │
//! │  │ list · read · create_exclusive ·     │   │ SyncStateStore       │  │
//! │  │ write_atomic · delete                │   │ (SQLite / memory)    │  │
//! │  └──────────────────────────────────────┘   └──────────────────────┘  │
//! │                                                                         │
//! │  STATUS: SyncHealth { last_sync_at, is_stale, pending_local_changes,   │
//! │                       last_round_conflicts, last_error }               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent` scheduler and event emitter
//! - [`engine`] - `SyncEngine`: one round end to end
//! - [`lock`] - Lock Coordinator
//! - [`outbox`] - Change Set publishing
//! - [`inbound`] - Peer Change Collector
//! - [`apply`] - Apply/Commit Stage
//! - [`gc`] - Acknowledgments and Change Set pruning
//! - [`status`] - Status Reporter and folder overview
//! - [`protocol`] - File names and document codecs
//! - [`folder`] - Shared folder abstraction
//! - [`store`] - Storage traits and the in-memory store
//! - [`config`] - Sync configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wiredpart_db::{Database, DbConfig};
//! use wiredpart_sync::{RoundMode, SyncAgent, SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new("wiredpart.db")).await?;
//!
//! let engine = Arc::new(SyncEngine::with_database(config, &db));
//! let agent = SyncAgent::new(engine.clone()).spawn();
//!
//! let report = agent.trigger(RoundMode::Full).await?;
//! println!("wrote {} record(s)", report.records_written);
//!
//! let health = engine.health().await?;
//! println!("{}", health.state.label());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod apply;
pub mod config;
pub mod engine;
pub mod error;
pub mod folder;
pub mod gc;
pub mod inbound;
pub mod lock;
pub mod outbox;
pub mod protocol;
pub mod status;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, NoOpEmitter, SyncAgent, SyncAgentHandle, SyncEventEmitter};
pub use apply::{CommitStage, CommitSummary};
pub use config::SyncConfig;
pub use engine::{RoundMode, RoundReport, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use folder::{FolderEntry, FsFolder, MemoryFolder, SyncFolder};
pub use gc::{GarbageCollector, GcReport};
pub use inbound::{PeerChanges, PeerCollector, SkipReason, SkippedFile};
pub use lock::{LockCoordinator, LockHandle, LockToken};
pub use outbox::{Outbox, PublishedChangeSet};
pub use status::{current_health, folder_overview, PeerSummary};
pub use store::{MemoryStore, RecordStore, SyncStateStore};
