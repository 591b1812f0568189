//! Core data structures for patch reconciliation.
//!
//! This module defines the identity model (live vs. provisional users),
//! the role and lifecycle enums stored in the database, and the outcome
//! types returned by reconciliation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::schema::{LiveUser, PendingUser};

/// Identifier of a confirmed account in `users`.
pub type UserId = String;

/// Identifier of a not-yet-activated account in `pending_users`.
pub type PendingId = String;

/// Identifier of a territory in `patches`.
pub type PatchId = String;

/// Role carried by live and provisional users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    LeadOrganiser,
    Organiser,
    Delegate,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::LeadOrganiser => "lead_organiser",
            Role::Organiser => "organiser",
            Role::Delegate => "delegate",
            Role::Viewer => "viewer",
        }
    }

    /// Only lead organisers own a patch scope.
    pub fn is_lead(&self) -> bool {
        matches!(self, Role::LeadOrganiser)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "lead_organiser" => Ok(Role::LeadOrganiser),
            "organiser" => Ok(Role::Organiser),
            "delegate" => Ok(Role::Delegate),
            "viewer" => Ok(Role::Viewer),
            other => Err(crate::Error::InvalidRole(other.to_string())),
        }
    }
}

/// Lifecycle status of a provisional (pending) user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionalStatus {
    Draft,
    Invited,
    /// A live account was created; the pending row is kept for history.
    Activated,
    Archived,
}

impl ProvisionalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionalStatus::Draft => "draft",
            ProvisionalStatus::Invited => "invited",
            ProvisionalStatus::Activated => "activated",
            ProvisionalStatus::Archived => "archived",
        }
    }

    /// Archived pending users are invisible to scope computation.
    pub fn is_archived(&self) -> bool {
        matches!(self, ProvisionalStatus::Archived)
    }
}

impl fmt::Display for ProvisionalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProvisionalStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ProvisionalStatus::Draft),
            "invited" => Ok(ProvisionalStatus::Invited),
            "activated" => Ok(ProvisionalStatus::Activated),
            "archived" => Ok(ProvisionalStatus::Archived),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Which user table an edge endpoint lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Live,
    Provisional,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Live => "live",
            IdentityKind::Provisional => "provisional",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IdentityKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(IdentityKind::Live),
            "provisional" => Ok(IdentityKind::Provisional),
            other => Err(crate::Error::InvalidKind(other.to_string())),
        }
    }
}

/// A lead organiser, either confirmed or provisional.
///
/// Produced only by [`Identity::coordinator`], so a value of this type is
/// always a lead organiser and never both variants at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Coordinator {
    Live(UserId),
    Provisional(PendingId),
}

impl Coordinator {
    pub fn id(&self) -> &str {
        match self {
            Coordinator::Live(id) | Coordinator::Provisional(id) => id,
        }
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Coordinator::Live(_) => IdentityKind::Live,
            Coordinator::Provisional(_) => IdentityKind::Provisional,
        }
    }
}

impl fmt::Display for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Result of resolving an identifier against both user tables.
///
/// Live rows take precedence: an id present in `users` resolves to
/// `Live` even when a stale `pending_users` row shares the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Live(LiveUser),
    Provisional(PendingUser),
    Unknown,
}

impl Identity {
    /// Resolve with live precedence from the two optional lookups.
    pub fn resolve(live: Option<LiveUser>, pending: Option<PendingUser>) -> Self {
        match (live, pending) {
            (Some(user), _) => Identity::Live(user),
            (None, Some(pending)) => Identity::Provisional(pending),
            (None, None) => Identity::Unknown,
        }
    }

    /// Returns the coordinator view if this identity is a lead organiser.
    pub fn coordinator(&self) -> Option<Coordinator> {
        match self {
            Identity::Live(user) if user.is_active && user.role.is_lead() => {
                Some(Coordinator::Live(user.id.clone()))
            }
            Identity::Provisional(pending)
                if pending.role.is_lead() && !pending.status.is_archived() =>
            {
                Some(Coordinator::Provisional(pending.id.clone()))
            }
            _ => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Identity::Provisional(_))
    }
}

/// How change-detection triggers dispatch reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Reconcile inside the originating write's transaction (fail-closed).
    #[default]
    Inline,
    /// Enqueue a reconcile job inside the originating transaction.
    Queued,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Inline => write!(f, "inline"),
            TriggerMode::Queued => write!(f, "queued"),
        }
    }
}

impl FromStr for TriggerMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(TriggerMode::Inline),
            "queued" => Ok(TriggerMode::Queued),
            other => Err(crate::Error::InvalidTriggerMode(other.to_string())),
        }
    }
}

/// State of a row in `reconcile_jobs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::Error::InvalidJobStatus(other.to_string())),
        }
    }
}

/// Who is invoking a privilege-gated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The reconciliation daemon itself.
    System,
    /// A live user; must hold the admin role.
    User(UserId),
}

impl Actor {
    /// A live user acting through an outer surface such as the CLI.
    ///
    /// Outer surfaces never yield [`Actor::System`]; only in-process callers
    /// like the daemon construct it.
    pub fn user(id: impl Into<UserId>) -> Self {
        Actor::User(id.into())
    }
}

/// Counts from a single reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub coordinator_id: String,
    pub added: usize,
    pub removed: usize,
    /// Set when the id resolved to a provisional identity and no writes ran.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped_provisional: bool,
}

impl ReconcileOutcome {
    pub fn unchanged(coordinator_id: impl Into<String>) -> Self {
        Self {
            coordinator_id: coordinator_id.into(),
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// A coordinator whose reconciliation failed during a bulk sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub coordinator_id: String,
    pub error: String,
}

/// Aggregate result of a bulk reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub coordinators_processed: usize,
    pub total_added: usize,
    pub total_removed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SweepFailure>,
}

impl ReconcileSummary {
    /// Fold one outcome into the totals.
    pub fn record(&mut self, outcome: &ReconcileOutcome) {
        self.coordinators_processed += 1;
        self.total_added += outcome.added;
        self.total_removed += outcome.removed;
    }

    pub fn record_failure(&mut self, coordinator_id: impl Into<String>, error: impl fmt::Display) {
        self.failures.push(SweepFailure {
            coordinator_id: coordinator_id.into(),
            error: error.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }
}
