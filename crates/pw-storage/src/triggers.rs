//! Change detection for hierarchy writes.
//!
//! Every upstream write names the relation it touched as a
//! [`HierarchyChange`]. The trigger resolves which live leads may have a
//! different scope afterwards and, inside the write's own transaction,
//! either reconciles them ([`TriggerMode::Inline`]) or enqueues a job for
//! each ([`TriggerMode::Queued`]).

use chrono::{NaiveDate, Utc};
use pw_core::{IdentityKind, PendingId, ReconcileOutcome, TriggerMode, UserId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;
use turso::{params, Connection};

use crate::db::{self, day, first_row, Result};
use crate::queue;
use crate::reconcile;

/// The relation a write touched and the row end that matters for scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyChange {
    /// A live lead -> live organiser link was added or ended.
    SupervisionLink { lead_id: UserId },
    /// A link with a provisional end was added or ended.
    ProvisionalLink {
        lead_kind: IdentityKind,
        lead_id: String,
    },
    /// A live organiser's field assignments changed.
    FieldAssignment { organiser_id: UserId },
    /// A pending user's direct patches or lifecycle changed.
    DirectPatches { pending_id: PendingId },
    /// A live user's role or activation may have changed.
    LiveUser { user_id: UserId },
}

impl fmt::Display for HierarchyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HierarchyChange::SupervisionLink { lead_id } => write!(f, "supervision_link:{}", lead_id),
            HierarchyChange::ProvisionalLink { lead_kind, lead_id } => {
                write!(f, "provisional_link:{}:{}", lead_kind, lead_id)
            }
            HierarchyChange::FieldAssignment { organiser_id } => {
                write!(f, "field_assignment:{}", organiser_id)
            }
            HierarchyChange::DirectPatches { pending_id } => write!(f, "direct_patches:{}", pending_id),
            HierarchyChange::LiveUser { user_id } => write!(f, "live_user:{}", user_id),
        }
    }
}

/// What a write's trigger did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    /// Live leads whose scope may have changed.
    pub affected: Vec<UserId>,
    /// Inline mode: one outcome per affected lead.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<ReconcileOutcome>,
    /// Queued mode: jobs inserted (coalesced leads are not counted).
    pub jobs_enqueued: usize,
}

impl TriggerReport {
    pub fn total_added(&self) -> usize {
        self.outcomes.iter().map(|o| o.added).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.outcomes.iter().map(|o| o.removed).sum()
    }
}

/// Resolve the affected leads and reconcile or enqueue each.
pub(crate) async fn dispatch(
    conn: &Connection,
    mode: TriggerMode,
    change: &HierarchyChange,
) -> Result<TriggerReport> {
    let now = Utc::now();
    let affected = affected_coordinators(conn, change, now.date_naive()).await?;
    debug!("{} affects {:?}", change, affected);

    let mut report = TriggerReport {
        affected: affected.into_iter().collect(),
        ..Default::default()
    };

    match mode {
        TriggerMode::Inline => {
            for lead_id in &report.affected {
                let outcome = reconcile::reconcile_in(conn, lead_id, now).await?;
                report.outcomes.push(outcome);
            }
        }
        TriggerMode::Queued => {
            let reason = change.to_string();
            for lead_id in &report.affected {
                if queue::enqueue_in(conn, lead_id, &reason, now).await?.is_some() {
                    report.jobs_enqueued += 1;
                }
            }
        }
    }

    Ok(report)
}

/// Live leads whose scope may differ after `change`.
pub(crate) async fn affected_coordinators(
    conn: &Connection,
    change: &HierarchyChange,
    today: NaiveDate,
) -> Result<BTreeSet<UserId>> {
    let mut affected = BTreeSet::new();

    match change {
        HierarchyChange::SupervisionLink { lead_id } => {
            if db::is_live_lead(conn, lead_id).await? {
                affected.insert(lead_id.clone());
            }
        }
        HierarchyChange::ProvisionalLink { lead_kind, lead_id } => {
            // provisional leads never get persisted rows
            if *lead_kind == IdentityKind::Live && db::is_live_lead(conn, lead_id).await? {
                affected.insert(lead_id.clone());
            }
        }
        HierarchyChange::FieldAssignment { organiser_id } => {
            for lead_id in supervising_leads(conn, organiser_id, today).await? {
                if db::is_live_lead(conn, &lead_id).await? {
                    affected.insert(lead_id);
                }
            }
        }
        HierarchyChange::DirectPatches { pending_id } => {
            for lead_id in provisional_supervisors(conn, pending_id, today).await? {
                if db::is_live_lead(conn, &lead_id).await? {
                    affected.insert(lead_id);
                }
            }
        }
        HierarchyChange::LiveUser { user_id } => {
            if db::is_live_lead(conn, user_id).await? || holds_open_rows(conn, user_id).await? {
                affected.insert(user_id.clone());
            }
        }
    }

    Ok(affected)
}

async fn supervising_leads(
    conn: &Connection,
    organiser_id: &str,
    today: NaiveDate,
) -> Result<Vec<UserId>> {
    let today = day(today);
    let mut rows = conn
        .query(
            r#"
            SELECT lead_id FROM lead_organiser_links
            WHERE organiser_id = ? AND is_active = 1 AND start_date <= ?
              AND (end_date IS NULL OR end_date >= ?)
            "#,
            params![organiser_id, today.clone(), today],
        )
        .await?;

    let mut leads = Vec::new();
    while let Some(row) = rows.next().await? {
        leads.push(row.get::<String>(0)?);
    }

    Ok(leads)
}

/// Live leads linked to a provisional organiser through active provisional links.
async fn provisional_supervisors(
    conn: &Connection,
    pending_id: &str,
    today: NaiveDate,
) -> Result<Vec<UserId>> {
    let today = day(today);
    let mut rows = conn
        .query(
            r#"
            SELECT lead_id FROM provisional_links
            WHERE lead_kind = ? AND organiser_kind = ? AND organiser_id = ?
              AND is_active = 1 AND start_date <= ?
              AND (end_date IS NULL OR end_date >= ?)
            "#,
            params![
                IdentityKind::Live.as_str(),
                IdentityKind::Provisional.as_str(),
                pending_id,
                today.clone(),
                today
            ],
        )
        .await?;

    let mut leads = Vec::new();
    while let Some(row) = rows.next().await? {
        leads.push(row.get::<String>(0)?);
    }

    Ok(leads)
}

async fn holds_open_rows(conn: &Connection, lead_id: &str) -> Result<bool> {
    let rows = conn
        .query(
            "SELECT 1 FROM lead_patch_assignments WHERE lead_id = ? AND effective_to IS NULL LIMIT 1",
            params![lead_id],
        )
        .await?;

    Ok(first_row(rows).await?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use pw_core::{LiveUser, Patch, Role};
    use tempfile::TempDir;

    async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("triggers.db")).await.unwrap();
        db.init_schema().await.unwrap();
        (db, temp_dir)
    }

    fn live(id: &str, role: Role) -> LiveUser {
        LiveUser {
            id: id.to_string(),
            email: format!("{}@example.org", id),
            full_name: None,
            role,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_field_assignment_reaches_every_supervising_lead() {
        let (mut db, _dir) = create_test_db().await;
        let today = Utc::now().date_naive();

        for id in ["lead-a", "lead-b"] {
            db.upsert_user(&live(id, Role::LeadOrganiser)).await.unwrap();
        }
        db.upsert_user(&live("admin", Role::Admin)).await.unwrap();
        db.upsert_user(&live("org", Role::Organiser)).await.unwrap();
        for lead in ["lead-a", "lead-b", "admin"] {
            db.add_supervision_link(lead, "org", today, None).await.unwrap();
        }

        let change = HierarchyChange::FieldAssignment {
            organiser_id: "org".to_string(),
        };
        let affected = affected_coordinators(&db.conn, &change, today).await.unwrap();
        let expected: BTreeSet<String> = ["lead-a", "lead-b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(affected, expected);
    }

    #[tokio::test]
    async fn test_provisional_anchored_links_affect_nobody() {
        let (db, _dir) = create_test_db().await;
        let today = Utc::now().date_naive();

        let change = HierarchyChange::ProvisionalLink {
            lead_kind: IdentityKind::Provisional,
            lead_id: "pend-lead".to_string(),
        };
        assert!(affected_coordinators(&db.conn, &change, today)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_queued_writes_coalesce_jobs() {
        let (db, _dir) = create_test_db().await;
        let mut db = db.with_trigger_mode(TriggerMode::Queued);
        let today = Utc::now().date_naive();
        db.upsert_patch(&Patch {
            id: "p1".to_string(),
            name: "P1".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let report = db.upsert_user(&live("lead", Role::LeadOrganiser)).await.unwrap();
        assert_eq!(report.affected, vec!["lead".to_string()]);
        assert_eq!(report.jobs_enqueued, 1);

        db.upsert_user(&live("org", Role::Organiser)).await.unwrap();
        let (_, report) = db.add_supervision_link("lead", "org", today, None).await.unwrap();
        assert_eq!(report.jobs_enqueued, 0, "pending job for lead is reused");

        let (_, report) = db.assign_organiser_patch("org", "p1").await.unwrap();
        assert_eq!(report.affected, vec!["lead".to_string()]);
        assert!(report.outcomes.is_empty());

        let counts = db.job_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert!(db.active_lead_patches("lead").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_demoting_a_lead_closes_their_rows() {
        let (db, _dir) = create_test_db().await;
        let mut db = db.with_trigger_mode(TriggerMode::Inline);
        let today = Utc::now().date_naive();
        db.upsert_patch(&Patch {
            id: "p1".to_string(),
            name: "P1".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        db.upsert_user(&live("lead", Role::LeadOrganiser)).await.unwrap();
        db.upsert_user(&live("org", Role::Organiser)).await.unwrap();
        db.add_supervision_link("lead", "org", today, None).await.unwrap();
        let (_, report) = db.assign_organiser_patch("org", "p1").await.unwrap();
        assert_eq!(report.total_added(), 1);

        let mut demoted = live("lead", Role::Organiser);
        demoted.updated_at = Utc::now();
        let report = db.upsert_user(&demoted).await.unwrap();
        assert_eq!(report.total_removed(), 1);
        assert!(db.active_lead_patches("lead").await.unwrap().is_empty());

        let promoted = live("lead", Role::LeadOrganiser);
        let report = db.upsert_user(&promoted).await.unwrap();
        assert_eq!(report.total_added(), 1);
        assert_eq!(db.lead_patch_history("lead").await.unwrap().len(), 2);
    }
}
