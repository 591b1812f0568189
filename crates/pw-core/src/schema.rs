//! Row schema definitions for the hierarchy and assignment relations.
//!
//! Each struct mirrors one table created by `pw-storage`. Upstream
//! administrative flows build these values and hand them to the storage
//! layer, which validates them before writing.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IdentityKind, JobStatus, PatchId, PendingId, ProvisionalStatus, Role, UserId};

/// A confirmed account from the user directory (`users`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUser {
    pub id: UserId,
    pub email: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,

    pub role: Role,

    /// Deactivated users keep their rows but own no scope.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveUser {
    pub fn validate(&self) -> crate::Result<()> {
        validate_id("id", &self.id)?;
        validate_email(&self.email)
    }
}

/// A staged, not-yet-activated account (`pending_users`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUser {
    pub id: PendingId,
    pub email: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,

    pub role: Role,
    pub status: ProvisionalStatus,

    /// Patches assigned directly to this provisional identity.
    #[serde(default)]
    pub assigned_patch_ids: Vec<PatchId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingUser {
    pub fn validate(&self) -> crate::Result<()> {
        validate_id("id", &self.id)?;
        validate_email(&self.email)?;
        validate_patch_ids(&self.assigned_patch_ids)
    }
}

/// A territory (`patches`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: PatchId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Patch {
    pub fn validate(&self) -> crate::Result<()> {
        validate_id("id", &self.id)?;
        if self.name.is_empty() {
            return Err(crate::Error::SchemaValidation("name is required".to_string()));
        }
        if self.name.len() > 200 {
            return Err(crate::Error::SchemaValidation(format!(
                "name must be 200 characters or less (got {})",
                self.name.len()
            )));
        }
        Ok(())
    }
}

/// Live lead supervises live organiser (`lead_organiser_links`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionLink {
    pub id: String,
    pub lead_id: UserId,
    pub organiser_id: UserId,
    pub start_date: NaiveDate,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,

    pub is_active: bool,
}

impl SupervisionLink {
    pub fn validate(&self) -> crate::Result<()> {
        validate_id("lead_id", &self.lead_id)?;
        validate_id("organiser_id", &self.organiser_id)?;
        if self.lead_id == self.organiser_id {
            return Err(crate::Error::SchemaValidation(
                "a lead cannot supervise themselves".to_string(),
            ));
        }
        validate_window(self.start_date, self.end_date)
    }

    /// Whether the link contributes to scope on the given day.
    pub fn is_active_on(&self, day: NaiveDate) -> bool {
        link_active_on(self.is_active, self.start_date, self.end_date, day)
    }
}

/// A supervision link with at least one provisional end (`provisional_links`).
///
/// Live lead to provisional organiser, or provisional lead to a live or
/// provisional organiser. Live to live is a [`SupervisionLink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionalLink {
    pub id: String,
    pub lead_kind: IdentityKind,
    pub lead_id: String,
    pub organiser_kind: IdentityKind,
    pub organiser_id: String,
    pub start_date: NaiveDate,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,

    pub is_active: bool,
}

impl ProvisionalLink {
    pub fn validate(&self) -> crate::Result<()> {
        validate_id("lead_id", &self.lead_id)?;
        validate_id("organiser_id", &self.organiser_id)?;
        if self.lead_kind == IdentityKind::Live && self.organiser_kind == IdentityKind::Live {
            return Err(crate::Error::SchemaValidation(
                "live lead to live organiser must be a supervision link".to_string(),
            ));
        }
        if self.lead_kind == self.organiser_kind && self.lead_id == self.organiser_id {
            return Err(crate::Error::SchemaValidation(
                "a lead cannot supervise themselves".to_string(),
            ));
        }
        validate_window(self.start_date, self.end_date)
    }

    pub fn is_active_on(&self, day: NaiveDate) -> bool {
        link_active_on(self.is_active, self.start_date, self.end_date, day)
    }
}

/// Live organiser assigned to a patch (`organiser_patch_assignments`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganiserPatchAssignment {
    pub id: String,
    pub organiser_id: UserId,
    pub patch_id: PatchId,
    pub effective_from: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<DateTime<Utc>>,
}

impl OrganiserPatchAssignment {
    pub fn is_open(&self) -> bool {
        self.effective_to.is_none()
    }
}

/// Live lead owns a patch (`lead_patch_assignments`). Written only by the
/// reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadPatchAssignment {
    pub id: String,
    pub lead_id: UserId,
    pub patch_id: PatchId,
    pub effective_from: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<DateTime<Utc>>,
}

impl LeadPatchAssignment {
    pub fn is_open(&self) -> bool {
        self.effective_to.is_none()
    }
}

/// A queued request to reconcile one coordinator (`reconcile_jobs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileJob {
    pub id: String,
    pub coordinator_id: String,

    /// Which change enqueued the job, for operators.
    pub reason: String,

    pub status: JobStatus,
    pub attempts: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn link_active_on(
    is_active: bool,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    day: NaiveDate,
) -> bool {
    is_active && start_date <= day && end_date.map_or(true, |end| end >= day)
}

fn validate_id(field: &str, value: &str) -> crate::Result<()> {
    if value.is_empty() {
        return Err(crate::Error::SchemaValidation(format!("{} is required", field)));
    }
    if value.len() > 128 {
        return Err(crate::Error::SchemaValidation(format!(
            "{} must be 128 characters or less (got {})",
            field,
            value.len()
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> crate::Result<()> {
    if !email.contains('@') {
        return Err(crate::Error::SchemaValidation(format!(
            "email is not an address: {}",
            email
        )));
    }
    Ok(())
}

fn validate_window(start: NaiveDate, end: Option<NaiveDate>) -> crate::Result<()> {
    if let Some(end) = end {
        if end < start {
            return Err(crate::Error::SchemaValidation(format!(
                "end_date {} is before start_date {}",
                end, start
            )));
        }
    }
    Ok(())
}

fn validate_patch_ids(ids: &[PatchId]) -> crate::Result<()> {
    for id in ids {
        validate_id("patch id", id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn link(start: &str, end: Option<&str>, is_active: bool) -> SupervisionLink {
        SupervisionLink {
            id: "link-1".to_string(),
            lead_id: "lead".to_string(),
            organiser_id: "org".to_string(),
            start_date: day(start),
            end_date: end.map(day),
            is_active,
        }
    }

    #[test]
    fn test_link_activity_window() {
        let open = link("2026-01-01", None, true);
        assert!(open.is_active_on(day("2026-01-01")));
        assert!(open.is_active_on(day("2030-06-30")));
        assert!(!open.is_active_on(day("2025-12-31")), "not yet started");

        let ended = link("2026-01-01", Some("2026-03-31"), true);
        assert!(ended.is_active_on(day("2026-03-31")), "end date is inclusive");
        assert!(!ended.is_active_on(day("2026-04-01")));

        let flagged_off = link("2026-01-01", None, false);
        assert!(!flagged_off.is_active_on(day("2026-02-01")));
    }

    #[test]
    fn test_supervision_link_validation() {
        assert!(link("2026-01-01", None, true).validate().is_ok());
        assert!(link("2026-02-01", Some("2026-01-01"), true).validate().is_err());

        let mut own = link("2026-01-01", None, true);
        own.organiser_id = "lead".to_string();
        assert!(own.validate().is_err());
    }

    #[test]
    fn test_provisional_link_rejects_live_to_live() {
        let mut plink = ProvisionalLink {
            id: "pl-1".to_string(),
            lead_kind: IdentityKind::Live,
            lead_id: "lead".to_string(),
            organiser_kind: IdentityKind::Live,
            organiser_id: "org".to_string(),
            start_date: day("2026-01-01"),
            end_date: None,
            is_active: true,
        };
        assert!(plink.validate().is_err());

        plink.organiser_kind = IdentityKind::Provisional;
        assert!(plink.validate().is_ok());
    }

    #[test]
    fn test_pending_user_rejects_empty_patch_ids() {
        let pending = PendingUser {
            id: "p-1".to_string(),
            email: "p1@example.org".to_string(),
            full_name: None,
            role: Role::Organiser,
            status: ProvisionalStatus::Draft,
            assigned_patch_ids: vec!["patch-1".to_string(), String::new()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(pending.validate().is_err());
    }
}
