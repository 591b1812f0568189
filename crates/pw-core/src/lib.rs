//! Core types for the patchwork reconciliation engine.
//!
//! This crate provides the identity model, row schemas, configuration and
//! error types shared by the storage layer, the worker daemon and the CLI.

pub mod config;
pub mod error;
pub mod schema;
pub mod types;

pub use config::{DashboardSettings, PatchworkConfig, WorkerSettings, STATE_DIR};
pub use error::{Error, Result};
pub use schema::{
    LeadPatchAssignment, LiveUser, OrganiserPatchAssignment, Patch, PendingUser, ProvisionalLink,
    ReconcileJob, SupervisionLink,
};

// Re-export main types for convenience
pub use types::{
    Actor, Coordinator, Identity, IdentityKind, JobStatus, PatchId, PendingId, ProvisionalStatus,
    ReconcileOutcome, ReconcileSummary, Role, SweepFailure, TriggerMode, UserId,
};
