//! PW Storage - hierarchy store and reconciliation engine for patchwork
//!
//! This crate keeps `lead_patch_assignments`, the denormalised "which
//! patches does this lead organiser own right now" table, consistent with
//! a hierarchy of live and provisional users.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Upstream writes (CLI, admin flows)        │
//! └─────────────────┬───────────────────────────┘
//!                   │ one transaction per write
//! ┌─────────────────▼───────────────────────────┐
//! │   triggers: affected lead resolution        │
//! │     inline ─► reconcile                     │
//! │     queued ─► reconcile_jobs                │
//! └─────────────────┬───────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────┐
//! │   reconcile: diff scope vs open rows        │
//! │   scope: closure over links + assignments   │
//! └─────────────────┬───────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────┐
//! │   Turso database (.patchwork/patchwork.db)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use pw_core::{Actor, TriggerMode};
//! use pw_storage::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut db = Database::open(".patchwork/patchwork.db")
//!     .await?
//!     .with_trigger_mode(TriggerMode::Inline);
//! db.init_schema().await?;
//!
//! let scope = db.compute_scope("lead-1").await?;
//! let outcome = db.reconcile("lead-1").await?;
//! println!("{} patches, +{} -{}", scope.len(), outcome.added, outcome.removed);
//!
//! let summary = db.reconcile_all(&Actor::System).await?;
//! println!("{} leads reconciled", summary.coordinators_processed);
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod queue;
pub mod reconcile;
pub mod scope;
pub mod triggers;

// Re-export commonly used types
pub use db::{Database, DbError, Result};
pub use queue::JobCounts;
pub use triggers::{HierarchyChange, TriggerReport};
