//! # wiredpart-core: Pure Sync Model for WiredPart
//!
//! This crate is the **heart** of the WiredPart folder sync engine. It holds
//! the record model, the last-write-wins merge and sync health derivation as
//! pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      WiredPart Sync Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    sync-cli / presentation                      │   │
//! │  │        init ──► sync ──► status ──► watch ──► peers            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    wiredpart-sync (engine)                      │   │
//! │  │    lock ─► publish ─► collect ─► merge ─► commit ─► status     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ wiredpart-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   merge   │  │  status   │  │ validation│  │   │
//! │  │   │  Record   │  │  Merger   │  │ SyncHealth│  │  ids and  │  │   │
//! │  │   │ ChangeSet │  │  LWW cmp  │  │  derive   │  │ structure │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO FOLDER ACCESS • PURE FUNCTIONS     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  wiredpart-db (Database Layer)                  │   │
//! │  │         SQLite record store, watermark, device identity         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Record, ChangeSet and friends
//! - [`merge`] - Version ordering and the Merge Engine
//! - [`state`] - Durable per-device sync state
//! - [`status`] - Sync health derivation
//! - [`error`] - Domain error types
//! - [`validation`] - Identifier and Change Set validation
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use wiredpart_core::{merge, Fields, LocalState, Record};
//!
//! let t = |ms| Utc.timestamp_millis_opt(ms).unwrap();
//! let mut local = LocalState::new();
//! let stale = Record::live("parts", "P-100", Fields::new(), t(90), "dev-b");
//! local.insert(stale.key(), stale);
//!
//! let mut change_set = wiredpart_core::ChangeSet::new("dev-a", 1, t(110));
//! change_set.push_table("parts", vec![Record::live("parts", "P-100", Fields::new(), t(100), "dev-a")]);
//!
//! let outcome = merge(local, &[change_set]);
//! assert_eq!(outcome.changes.len(), 1);
//! assert_eq!(outcome.changes[0].origin_device, "dev-a");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod merge;
pub mod state;
pub mod status;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use merge::{compare_versions, merge, supersedes, LocalState, MergeOutcome, Merger};
pub use state::{RoundCommit, SyncState};
pub use status::{derive_health, ErrorKind, HealthState, LastError, StatusInputs, SyncHealth};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Change Set document format spoken by this build.
///
/// Peers reject documents carrying any other value.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default synchronized tables, parents before children.
pub const SYNC_TABLES: &[&str] = &[
    "categories",
    "suppliers",
    "users",
    "hats",
    "hat_permissions",
    "user_hats",
    "parts",
    "part_suppliers",
    "brands",
    "part_variants",
    "parts_lists",
    "parts_list_items",
    "trucks",
    "jobs",
    "job_assignments",
    "bro_categories",
    "billing_cycles",
    "purchase_orders",
    "purchase_order_items",
    "receive_log",
    "truck_transfers",
    "truck_inventory",
    "labor_entries",
    "consumption_log",
    "job_parts",
    "return_authorizations",
    "return_items",
    "notebook_sections",
    "notebook_pages",
    "notebook_attachments",
    "job_updates",
    "activity_log",
    "notifications",
];
